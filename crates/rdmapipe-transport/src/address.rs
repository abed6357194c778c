//! Queue pair addressing.
//!
//! An [`Address`] is what two peers swap over the bootstrap channel before
//! connecting. Its wire form is fixed at [`ADDRESS_WIRE_LEN`] bytes: LID (u16 LE),
//! QPN (u32 LE) and a 16-byte GID, where an all-zero GID means "no GID".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bootstrap::Wire;

/// Encoded size of an [`Address`].
pub const ADDRESS_WIRE_LEN: usize = 22;

/// 128-bit global identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// Link-local GID (`fe80::/64`) with the given interface identifier.
    pub fn link_local(interface_id: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[8..].copy_from_slice(&interface_id.to_be_bytes());
        Gid(raw)
    }

    /// An all-zero GID, which the wire format uses for "no GID".
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Upper 64 bits.
    pub fn subnet_prefix(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(b)
    }

    /// Lower 64 bits.
    pub fn interface_id(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(b)
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Gid(raw)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// Identifies one queue pair on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "AddressRepr", into = "AddressRepr")]
pub struct Address {
    /// Local identifier of the port.
    pub lid: u16,
    /// Queue pair number.
    pub qp_num: u32,
    /// Global identifier, required on routed fabrics.
    pub gid: Option<Gid>,
}

#[derive(Serialize, Deserialize)]
struct AddressRepr {
    lid: u16,
    qp_num: u32,
    gid: [u8; 16],
}

impl From<AddressRepr> for Address {
    fn from(r: AddressRepr) -> Self {
        let gid = Gid(r.gid);
        Address {
            lid: r.lid,
            qp_num: r.qp_num,
            gid: if gid.is_zero() { None } else { Some(gid) },
        }
    }
}

impl From<Address> for AddressRepr {
    fn from(a: Address) -> Self {
        AddressRepr {
            lid: a.lid,
            qp_num: a.qp_num,
            gid: a.gid.unwrap_or_default().0,
        }
    }
}

impl Address {
    /// An address without a GID.
    pub fn new(lid: u16, qp_num: u32) -> Self {
        Self {
            lid,
            qp_num,
            gid: None,
        }
    }

    /// Attaches `gid`; a zero GID clears it.
    pub fn with_gid(mut self, gid: Gid) -> Self {
        self.gid = if gid.is_zero() { None } else { Some(gid) };
        self
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lid={} qpn={}", self.lid, self.qp_num)?;
        if let Some(gid) = &self.gid {
            write!(f, " gid={}", gid)?;
        }
        Ok(())
    }
}

impl Wire for Address {
    const WIRE_LEN: usize = ADDRESS_WIRE_LEN;
    const NAME: &'static str = "address";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_length() {
        let addr = Address::new(7, 42);
        let bytes = addr.encode().unwrap();
        assert_eq!(bytes.len(), ADDRESS_WIRE_LEN);
        assert_eq!(&bytes[..2], &7u16.to_le_bytes());
        assert_eq!(&bytes[2..6], &42u32.to_le_bytes());
        assert!(bytes[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zero_gid_decodes_as_none() {
        let addr = Address::new(9, 99).with_gid(Gid::default());
        assert_eq!(addr.gid, None);
        let back = Address::decode(&addr.encode().unwrap()).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_gid_survives_encoding() {
        let addr = Address::new(1, 0x123456).with_gid(Gid::link_local(0xabcdef));
        let back = Address::decode(&addr.encode().unwrap()).unwrap();
        assert_eq!(back.gid, Some(Gid::link_local(0xabcdef)));
        assert_eq!(back.gid.unwrap().subnet_prefix(), 0xfe80_0000_0000_0000);
        assert_eq!(back.gid.unwrap().interface_id(), 0xabcdef);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let bytes = Address::new(1, 2).encode().unwrap();
        assert!(Address::decode(&bytes[..ADDRESS_WIRE_LEN - 1]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::new(7, 42).to_string(), "lid=7 qpn=42");
        let gid = Gid::link_local(1);
        assert_eq!(gid.to_string(), "fe80:0000:0000:0000:0000:0000:0000:0001");
    }
}
