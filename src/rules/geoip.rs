//! GeoIP range database
//!
//! The database is a pre-built sorted array: `"GEO1"` magic (4 bytes),
//! entry count (u32 big-endian), then `count` records of
//! `start_ipv4 (u32 BE) | end_ipv4 (u32 BE) | country (u16 BE)`. Lookup is
//! a binary search for the largest start at or below the address, followed
//! by a range check against the record's end.
//!
//! All failure modes (missing file, bad magic, truncated array, address
//! outside every range) resolve to country `0`, which never equals a
//! configured bypass country.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use tracing::debug;

use crate::error::RuleError;

const MAGIC: &[u8; 4] = b"GEO1";
const HEADER_LEN: usize = 8;
const ENTRY_LEN: usize = 10;

/// Loaded GeoIP database
#[derive(Debug, Clone, Default)]
pub struct GeoIpDatabase {
    /// Raw entry bytes, `count * ENTRY_LEN` long
    entries: Vec<u8>,
    count: usize,
}

impl GeoIpDatabase {
    /// An empty database; every lookup returns 0.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate and take ownership of a raw database blob.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::GeoIpFormat` for a bad magic or a truncated
    /// entry array.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, RuleError> {
        if data.len() < HEADER_LEN {
            return Err(RuleError::GeoIpFormat("shorter than header".to_string()));
        }
        if &data[..4] != MAGIC {
            return Err(RuleError::GeoIpFormat("bad magic".to_string()));
        }
        let count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let needed = HEADER_LEN + count * ENTRY_LEN;
        if data.len() < needed {
            return Err(RuleError::GeoIpFormat(format!(
                "{count} entries need {needed} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            entries: data[HEADER_LEN..needed].to_vec(),
            count,
        })
    }

    /// Load the database file from disk.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::GeoIpFormat` for I/O or format errors.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let data = std::fs::read(path.as_ref())
            .map_err(|e| RuleError::GeoIpFormat(format!("read failed: {e}")))?;
        let db = Self::from_bytes(data)?;
        debug!(
            "GeoIP database loaded: {} entries from {}",
            db.count,
            path.as_ref().display()
        );
        Ok(db)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when no entries are loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn entry(&self, index: usize) -> (u32, u32, u16) {
        let e = &self.entries[index * ENTRY_LEN..(index + 1) * ENTRY_LEN];
        let start = u32::from_be_bytes([e[0], e[1], e[2], e[3]]);
        let end = u32::from_be_bytes([e[4], e[5], e[6], e[7]]);
        let country = u16::from_be_bytes([e[8], e[9]]);
        (start, end, country)
    }

    /// Look up the packed country code for an IPv4 address (0 = unknown)
    #[must_use]
    pub fn lookup_v4(&self, addr: Ipv4Addr) -> u16 {
        if self.count == 0 {
            return 0;
        }
        let ip = u32::from(addr);

        // Binary search: largest start <= ip
        let mut lo = 0usize;
        let mut hi = self.count - 1;
        let mut best: Option<usize> = None;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let (start, _, _) = self.entry(mid);
            if start <= ip {
                best = Some(mid);
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }

        let Some(best) = best else { return 0 };
        let (_, end, country) = self.entry(best);
        if ip > end {
            return 0;
        }
        country
    }

    /// Look up any IP address; IPv6 is not covered by the database.
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> u16 {
        match addr {
            IpAddr::V4(v4) => self.lookup_v4(v4),
            IpAddr::V6(_) => 0,
        }
    }

    /// Look up an IP literal; unparseable input yields 0.
    #[must_use]
    pub fn lookup_str(&self, ip: &str) -> u16 {
        ip.parse::<Ipv4Addr>().map_or(0, |v4| self.lookup_v4(v4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::pack_country_code;

    fn build_db(ranges: &[(u32, u32, u16)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&(ranges.len() as u32).to_be_bytes());
        for (start, end, country) in ranges {
            data.extend_from_slice(&start.to_be_bytes());
            data.extend_from_slice(&end.to_be_bytes());
            data.extend_from_slice(&country.to_be_bytes());
        }
        data
    }

    fn sample_db() -> GeoIpDatabase {
        let us = pack_country_code("US");
        let de = pack_country_code("DE");
        let jp = pack_country_code("JP");
        let data = build_db(&[
            (u32::from(Ipv4Addr::new(1, 0, 0, 0)), u32::from(Ipv4Addr::new(1, 0, 0, 255)), us),
            (u32::from(Ipv4Addr::new(5, 0, 0, 0)), u32::from(Ipv4Addr::new(5, 255, 255, 255)), de),
            (u32::from(Ipv4Addr::new(9, 9, 0, 0)), u32::from(Ipv4Addr::new(9, 9, 9, 9)), jp),
        ]);
        GeoIpDatabase::from_bytes(data).unwrap()
    }

    #[test]
    fn test_lookup_hits() {
        let db = sample_db();
        assert_eq!(db.lookup_str("1.0.0.1"), pack_country_code("US"));
        assert_eq!(db.lookup_str("1.0.0.255"), pack_country_code("US"));
        assert_eq!(db.lookup_str("5.128.0.1"), pack_country_code("DE"));
        assert_eq!(db.lookup_str("9.9.9.9"), pack_country_code("JP"));
    }

    #[test]
    fn test_lookup_misses() {
        let db = sample_db();
        // Below every range
        assert_eq!(db.lookup_str("0.0.0.1"), 0);
        // Gap between ranges
        assert_eq!(db.lookup_str("1.0.1.0"), 0);
        assert_eq!(db.lookup_str("4.0.0.0"), 0);
        // Above the last range
        assert_eq!(db.lookup_str("200.0.0.1"), 0);
        // Unparseable literal
        assert_eq!(db.lookup_str("not-an-ip"), 0);
        assert_eq!(db.lookup_str("2001:db8::1"), 0);
    }

    #[test]
    fn test_ipv6_unsupported() {
        let db = sample_db();
        assert_eq!(db.lookup("2001:db8::1".parse().unwrap()), 0);
        assert_eq!(
            db.lookup("1.0.0.1".parse().unwrap()),
            pack_country_code("US")
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut data = build_db(&[(0, 10, 1)]);
        data[0] = b'X';
        assert!(GeoIpDatabase::from_bytes(data).is_err());
    }

    #[test]
    fn test_truncated() {
        let mut data = build_db(&[(0, 10, 1)]);
        data.truncate(HEADER_LEN + 5);
        assert!(GeoIpDatabase::from_bytes(data).is_err());
        assert!(GeoIpDatabase::from_bytes(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_empty_db() {
        let db = GeoIpDatabase::from_bytes(build_db(&[])).unwrap();
        assert!(db.is_empty());
        assert_eq!(db.lookup_str("1.2.3.4"), 0);
        assert_eq!(GeoIpDatabase::empty().lookup_str("1.2.3.4"), 0);
    }
}
