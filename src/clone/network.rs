//! Network identity of a cloned VM.

use crate::vm::NetAdapter;
use rand::Rng;
use std::collections::HashSet;

/// Random MAC address under a 6-hex-digit vendor prefix.
pub fn generate_mac(prefix: &str, rng: &mut impl Rng) -> String {
    let suffix: [u8; 3] = rng.gen();
    format!(
        "{}{:02X}{:02X}{:02X}",
        prefix.to_ascii_uppercase(),
        suffix[0],
        suffix[1],
        suffix[2]
    )
}

/// Host-side interface name derived from a MAC address.
pub fn host_interface_name(mac: &str) -> String {
    format!("vme{}", mac.to_ascii_lowercase())
}

/// Give every adapter a fresh MAC and host interface name.
///
/// With `clear_addresses`, configured IP addresses are dropped as well.
pub fn regenerate(adapters: &mut [NetAdapter], prefix: &str, clear_addresses: bool) {
    let mut rng = rand::thread_rng();
    let mut used: HashSet<String> = HashSet::new();
    for adapter in adapters.iter_mut() {
        let mac = loop {
            let mac = generate_mac(prefix, &mut rng);
            if mac != adapter.mac && used.insert(mac.clone()) {
                break mac;
            }
        };
        tracing::debug!(index = adapter.index, old = %adapter.mac, new = %mac, "regenerated mac");
        adapter.host_interface = Some(host_interface_name(&mac));
        adapter.mac = mac;
        if clear_addresses {
            adapter.addresses.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use regex::Regex;

    fn adapter(index: u32, mac: &str) -> NetAdapter {
        NetAdapter {
            index,
            mac: mac.into(),
            host_interface: None,
            addresses: vec!["10.0.0.5/24".into()],
        }
    }

    #[test]
    fn test_generated_mac_keeps_prefix() {
        let re = Regex::new(r"^001C42[0-9A-F]{6}$").unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            assert!(re.is_match(&generate_mac("001c42", &mut rng)));
        }
    }

    #[test]
    fn test_interface_name_fits_ifnamsiz() {
        let name = host_interface_name("001C42AABBCC");
        assert_eq!(name, "vme001c42aabbcc");
        assert!(name.len() < 16);
    }

    #[test]
    fn test_regenerate_replaces_macs() {
        let mut adapters = vec![adapter(0, "001C42000001"), adapter(1, "001C42000002")];
        regenerate(&mut adapters, "C43772", false);

        let re = Regex::new(r"^C43772[0-9A-F]{6}$").unwrap();
        assert!(adapters.iter().all(|a| re.is_match(&a.mac)));
        assert_ne!(adapters[0].mac, adapters[1].mac);
        assert_eq!(
            adapters[0].host_interface.as_deref(),
            Some(host_interface_name(&adapters[0].mac).as_str())
        );
        assert_eq!(adapters[1].addresses, vec!["10.0.0.5/24".to_string()]);
    }

    #[test]
    fn test_regenerate_clears_addresses() {
        let mut adapters = vec![adapter(0, "001C42000001")];
        regenerate(&mut adapters, "001C42", true);
        assert!(adapters[0].addresses.is_empty());
    }
}
