use std::fmt;

/// Global identifier of a device port.
///
/// Carried for diagnostics only: connection establishment here is
/// LID-routed (no global routing header), so the gid is never part of the
/// exchanged address tuple.
#[derive(
    serde::Serialize, serde::Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Hash,
)]
#[repr(transparent)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    pub(crate) fn from_raw(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    /// The subnet-prefix half of the gid, read as big endian.
    pub fn subnet_prefix(&self) -> u64 {
        u64::from_be_bytes(self.raw[..8].try_into().unwrap())
    }

    /// The interface-id half of the gid, read as big endian.
    pub fn interface_id(&self) -> u64 {
        u64::from_be_bytes(self.raw[8..].try_into().unwrap())
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.raw.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(feature = "verbs")]
impl From<rdma_sys::ibv_gid> for Gid {
    fn from(gid: rdma_sys::ibv_gid) -> Self {
        Self::from_raw(unsafe { gid.raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_read_big_endian() {
        let gid = Gid::from_raw([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x07]);
        assert_eq!(gid.subnet_prefix(), 0xfe80_0000_0000_0000);
        assert_eq!(gid.interface_id(), 0x0000_0000_0000_0007);
    }

    #[test]
    fn displays_colon_separated_hex() {
        let gid = Gid::from_raw([0xfe; 16]);
        let text = gid.to_string();
        assert!(text.starts_with("fe:fe:"));
        assert_eq!(text.len(), 16 * 2 + 15);
    }
}
