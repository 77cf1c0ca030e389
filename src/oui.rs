//! OUI (Organizationally Unique Identifier) vendor lookup.
//!
//! A small embedded table mapping the first three octets of a MAC address
//! to a manufacturer label. Real deployments would ship the full IEEE
//! registry; this subset covers common lab/home-network hardware and
//! keeps the binary free of a multi-megabyte generated table.

const TABLE: &[(&str, &str)] = &[
    ("00:1a:11", "Google"),
    ("3c:5a:b4", "Google"),
    ("f4:f5:d8", "Google"),
    ("00:50:56", "VMware"),
    ("00:0c:29", "VMware"),
    ("00:1c:42", "Parallels"),
    ("08:00:27", "VirtualBox"),
    ("52:54:00", "QEMU/KVM"),
    ("b8:27:eb", "Raspberry Pi Foundation"),
    ("dc:a6:32", "Raspberry Pi Foundation"),
    ("e4:5f:01", "Raspberry Pi Foundation"),
    ("00:1b:63", "Apple"),
    ("ac:de:48", "Apple"),
    ("f0:18:98", "Apple"),
    ("3c:07:54", "Apple"),
    ("28:cf:e9", "Apple"),
    ("a4:c3:61", "Apple"),
    ("00:05:69", "VMware"),
    ("00:16:3e", "Xen"),
    ("fc:fb:fb", "Cisco"),
    ("00:1e:c9", "Dell"),
    ("d4:be:d9", "Dell"),
    ("00:21:9b", "Dell"),
    ("00:25:90", "Super Micro Computer"),
    ("b4:2e:99", "Intel"),
    ("00:1b:21", "Intel"),
    ("dc:a1:be", "Espressif"),
    ("24:6f:28", "Espressif"),
    ("a0:20:a6", "Espressif"),
    ("b0:a7:32", "Tp-Link"),
    ("50:c7:bf", "Tp-Link"),
    ("98:da:c4", "Tp-Link"),
    ("00:17:88", "Philips Hue"),
    ("ec:b5:fa", "Philips Hue"),
    ("18:b4:30", "Nest Labs"),
    ("f0:27:2d", "Amazon"),
    ("44:65:0d", "Amazon"),
    ("74:c2:46", "Amazon"),
];

/// Look up a vendor label from a canonical lowercase, colon-separated MAC.
/// Returns `None` when the prefix isn't in the embedded table.
pub fn lookup(mac: &str) -> Option<&'static str> {
    let lower = mac.to_ascii_lowercase();
    let prefix = lower.get(0..8)?;
    TABLE
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, vendor)| *vendor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_prefix_resolves() {
        assert_eq!(lookup("b8:27:eb:12:34:56"), Some("Raspberry Pi Foundation"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup("B8:27:EB:12:34:56"), Some("Raspberry Pi Foundation"));
    }

    #[test]
    fn unknown_prefix_is_none() {
        assert_eq!(lookup("aa:bb:cc:dd:ee:ff"), None);
    }
}
