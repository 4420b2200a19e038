use crate::message::Address;
use crate::{PeerId, validate_outbound_services};
use ip_network::IpNetwork;
use std::collections::HashSet;

/// Manages the addresses discovered in the network.
#[derive(Debug)]
pub struct AddressBook {
    /// Addresses available for establishing new connections.
    discovered_addresses: HashSet<PeerId>,
    /// Peers that currently have an active connection or are being dialed.
    active_addresses: HashSet<PeerId>,
    /// Addresses that failed to establish a connection.
    failed_addresses: HashSet<PeerId>,
    /// Indicates whether only IPv4 addresses should be stored.
    ipv4_only: bool,
    /// Maximum number of discovered addresses.
    max_addresses: usize,
    /// Random number generator for selecting peers.
    rng: fastrand::Rng,
}

impl AddressBook {
    pub fn new(ipv4_only: bool, max_addresses: usize) -> Self {
        Self {
            discovered_addresses: HashSet::new(),
            active_addresses: HashSet::new(),
            failed_addresses: HashSet::new(),
            ipv4_only,
            max_addresses,
            rng: fastrand::Rng::new(),
        }
    }

    /// Checks if the address book has reached the maximum number of addresses.
    pub fn has_max_addresses(&self) -> bool {
        self.discovered_addresses.len() >= self.max_addresses
    }

    pub fn available_addresses_count(&self) -> usize {
        self.discovered_addresses.len()
    }

    /// Pops a random address from the discovered addresses and marks it as active.
    pub fn pop(&mut self) -> Option<PeerId> {
        let peer = self.rng.choice(self.discovered_addresses.iter()).copied()?;
        self.discovered_addresses.remove(&peer);
        self.active_addresses.insert(peer);
        Some(peer)
    }

    pub fn note_failed_address(&mut self, peer_addr: PeerId) {
        self.active_addresses.remove(&peer_addr);
        self.failed_addresses.insert(peer_addr);
    }

    pub fn mark_disconnected(&mut self, peer_addr: &PeerId) {
        self.active_addresses.remove(peer_addr);
    }

    /// Adds the addresses of the configured seeds.
    ///
    /// Seeds are trusted by the operator, they are not required to be publicly routable.
    pub fn add_seeds(&mut self, seeds: Vec<PeerId>) -> usize {
        let mut added = 0;

        for addr in seeds {
            if self.ipv4_only && addr.is_ipv6() {
                continue;
            }
            if self.active_addresses.contains(&addr) {
                continue;
            }
            self.failed_addresses.remove(&addr);
            if self.discovered_addresses.insert(addr) {
                added += 1;
            }
        }

        added
    }

    /// Adds the addresses received in an `addr` message.
    pub fn add_many(&mut self, from: PeerId, addresses: Vec<(u32, Address)>) -> usize {
        let mut added = 0;

        for (_timestamp, address) in addresses {
            if self.has_max_addresses() {
                break;
            }

            if validate_outbound_services(address.services).is_err() {
                continue;
            }

            // Tor addresses have no socket address.
            let Ok(addr) = address.socket_addr() else {
                continue;
            };
            if self.should_add_address(from, addr) && self.discovered_addresses.insert(addr) {
                added += 1;
            }
        }

        added
    }

    fn should_add_address(&self, from: PeerId, new_addr: PeerId) -> bool {
        if from == new_addr || new_addr.port() == 0 {
            return false;
        }

        // Skip IPv6 if in IPv4-only mode.
        if self.ipv4_only && new_addr.is_ipv6() {
            return false;
        }

        // Private, loopback and reserved ranges are not dialable from the internet.
        if !IpNetwork::from(new_addr.ip()).is_global() {
            return false;
        }

        !self.failed_addresses.contains(&new_addr) && !self.active_addresses.contains(&new_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ServiceFlags;

    fn addr(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn net_address(s: &str, services: ServiceFlags) -> (u32, Address) {
        (0, Address::new(&addr(s), services))
    }

    #[test]
    fn only_routable_full_nodes_are_added() {
        let mut address_book = AddressBook::new(true, 10);
        let from = addr("8.8.8.8:8333");

        let added = address_book.add_many(
            from,
            vec![
                net_address("1.2.3.4:8333", ServiceFlags::NETWORK),
                net_address("5.6.7.8:8333", ServiceFlags::NONE),
                net_address("192.168.1.2:8333", ServiceFlags::NETWORK),
                net_address("127.0.0.1:8333", ServiceFlags::NETWORK),
                net_address("8.8.8.8:8333", ServiceFlags::NETWORK),
                net_address("[2001:4860::8888]:8333", ServiceFlags::NETWORK),
            ],
        );

        assert_eq!(added, 1);
        assert_eq!(address_book.pop(), Some(addr("1.2.3.4:8333")));
        assert_eq!(address_book.pop(), None);
    }

    #[test]
    fn failed_addresses_are_not_retried() {
        let mut address_book = AddressBook::new(true, 10);
        let peer = addr("1.2.3.4:8333");

        address_book.add_many(
            addr("8.8.8.8:8333"),
            vec![net_address("1.2.3.4:8333", ServiceFlags::NETWORK)],
        );
        assert_eq!(address_book.pop(), Some(peer));
        address_book.note_failed_address(peer);

        let added = address_book.add_many(
            addr("8.8.4.4:8333"),
            vec![net_address("1.2.3.4:8333", ServiceFlags::NETWORK)],
        );
        assert_eq!(added, 0);
    }

    #[test]
    fn seeds_bypass_the_routability_check() {
        let mut address_book = AddressBook::new(true, 1);
        assert_eq!(
            address_book.add_seeds(vec![addr("127.0.0.1:18444"), addr("127.0.0.1:18445")]),
            2
        );
        assert_eq!(address_book.available_addresses_count(), 2);
        assert!(address_book.has_max_addresses());
    }
}
