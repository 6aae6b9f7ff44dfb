//! Interface lookups used to wire a client to a NIC.

use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};
use std::{ffi::CString, fs, path::Path};

/// Parses a MAC address string (e.g., "0a:1b:2c:3d:4e:5f") into a `Bytes` object.
///
/// Dashes are accepted as separators too.
pub fn parse_mac_address(mac_str: &str) -> Result<Bytes, Error> {
    let mut bytes = BytesMut::with_capacity(6);
    for byte_str in mac_str.trim().split([':', '-']) {
        if byte_str.is_empty() {
            continue;
        }
        let byte = u8::from_str_radix(byte_str, 16)
            .map_err(|e| Error::MacParse(format!("{mac_str}: {e}")))?;
        bytes.put_u8(byte);
    }
    if bytes.len() != 6 {
        return Err(Error::MacParse(format!(
            "{mac_str}: expected 6 octets, got {}",
            bytes.len()
        )));
    }
    Ok(bytes.freeze())
}

/// Reads the hardware address of `interface` from sysfs.
pub fn hardware_addr(interface: &str) -> Result<Bytes, Error> {
    hardware_addr_under(Path::new("/sys/class/net"), interface)
}

pub(crate) fn hardware_addr_under(root: &Path, interface: &str) -> Result<Bytes, Error> {
    let path = root.join(interface).join("address");
    let mac_str = fs::read_to_string(&path)
        .map_err(|_| Error::InterfaceInvalid(interface.to_string()))?;
    parse_mac_address(&mac_str)
}

/// Resolves the kernel index of `interface`, needed to bind a packet socket.
pub fn index(interface: &str) -> Result<i32, Error> {
    let name = CString::new(interface).map_err(|_| Error::InterfaceInvalid(interface.to_string()))?;
    // SAFETY: `name` is a valid NUL-terminated string that outlives the call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(Error::InterfaceInvalid(interface.to_string()));
    }
    Ok(index as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_address() {
        let mac = parse_mac_address("aa:BB:0c:29:a8:f4\n").unwrap();
        assert_eq!(&mac[..], &[0xaa, 0xbb, 0x0c, 0x29, 0xa8, 0xf4]);

        let mac = parse_mac_address("08-00-27-DF-83-61").unwrap();
        assert_eq!(&mac[..], &[0x08, 0x00, 0x27, 0xdf, 0x83, 0x61]);
    }

    #[test]
    fn test_parse_mac_address_rejects_garbage() {
        assert!(matches!(parse_mac_address("zz:00:00:00:00:00"), Err(Error::MacParse(_))));
        assert!(matches!(parse_mac_address("00:11:22"), Err(Error::MacParse(_))));
    }

    #[test]
    fn test_hardware_addr_from_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("eth7");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("address"), "00:0c:29:a8:92:f4\n").unwrap();

        let mac = hardware_addr_under(root.path(), "eth7").unwrap();
        assert_eq!(&mac[..], &[0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4]);

        assert!(matches!(
            hardware_addr_under(root.path(), "eth8"),
            Err(Error::InterfaceInvalid(_))
        ));
    }

    #[test]
    fn test_index_of_unknown_interface() {
        assert!(index("no-such-if0").is_err());
    }
}
