//! Registry mapping opaque instances to small per-domain integer IDs
//!
//! Kernels cannot chase host pointers, so callers register instances under
//! a domain name and store the returned dense ID in arrays instead.  IDs
//! are 1-based (0 means "no instance") and reused smallest-first after
//! removal.

use crate::error::{Error, Result};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Default)]
struct Domain {
    entries: Vec<Option<usize>>,
    unused: BinaryHeap<Reverse<u32>>,
}

/// Pointer/ID registry, one ID space per domain
#[derive(Default)]
pub struct Registry {
    domains: HashMap<String, Domain>,
    reverse: HashMap<usize, (String, u32)>,
}

impl Registry {
    /// Registers a pointer, returning its ID within the domain
    pub fn put(&mut self, domain: &str, ptr: *mut u8) -> u32 {
        let d = self.domains.entry(domain.to_string()).or_default();
        let id = match d.unused.pop() {
            Some(Reverse(id)) => {
                d.entries[(id - 1) as usize] = Some(ptr as usize);
                id
            }
            None => {
                d.entries.push(Some(ptr as usize));
                d.entries.len() as u32
            }
        };
        self.reverse.insert(ptr as usize, (domain.to_string(), id));
        id
    }

    /// Removes a previously registered pointer
    pub fn remove(&mut self, ptr: *mut u8) -> Result<()> {
        let (domain, id) = self
            .reverse
            .remove(&(ptr as usize))
            .ok_or(Error::UnknownPointer(ptr as usize))?;
        let d = self.domains.get_mut(&domain).unwrap();
        d.entries[(id - 1) as usize] = None;
        d.unused.push(Reverse(id));
        Ok(())
    }

    /// Returns the ID of a registered pointer (0 when absent)
    pub fn get_id(&self, ptr: *const u8) -> u32 {
        self.reverse.get(&(ptr as usize)).map(|e| e.1).unwrap_or(0)
    }

    /// Returns the domain of a registered pointer
    pub fn get_domain(&self, ptr: *const u8) -> Option<&str> {
        self.reverse.get(&(ptr as usize)).map(|e| e.0.as_str())
    }

    /// Returns the pointer registered under `(domain, id)` (null when absent)
    pub fn get_ptr(&self, domain: &str, id: u32) -> *mut u8 {
        if id == 0 {
            return std::ptr::null_mut();
        }
        self.domains
            .get(domain)
            .and_then(|d| d.entries.get((id - 1) as usize))
            .and_then(|e| *e)
            .map(|p| p as *mut u8)
            .unwrap_or(std::ptr::null_mut())
    }

    /// Returns the largest ID ever handed out within the domain
    pub fn get_max(&self, domain: &str) -> u32 {
        self.domains
            .get(domain)
            .map(|d| d.entries.len() as u32)
            .unwrap_or(0)
    }

    /// Shrinks every domain by dropping trailing unregistered IDs
    pub fn trim(&mut self) {
        for d in self.domains.values_mut() {
            while matches!(d.entries.last(), Some(None)) {
                d.entries.pop();
            }
            let len = d.entries.len() as u32;
            let keep: Vec<Reverse<u32>> = d
                .unused
                .drain()
                .filter(|&Reverse(id)| id <= len)
                .collect();
            d.unused.extend(keep);
        }
        self.domains.retain(|_, d| !d.entries.is_empty());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn p(v: usize) -> *mut u8 {
        v as *mut u8
    }

    #[test]
    fn test_put_get() {
        let mut r = Registry::default();
        assert_eq!(r.put("Sensor", p(0x100)), 1);
        assert_eq!(r.put("Sensor", p(0x200)), 2);
        assert_eq!(r.put("Film", p(0x300)), 1);
        assert_eq!(r.get_id(p(0x200)), 2);
        assert_eq!(r.get_domain(p(0x300)), Some("Film"));
        assert_eq!(r.get_ptr("Sensor", 2), p(0x200));
        assert_eq!(r.get_max("Sensor"), 2);
        assert_eq!(r.get_ptr("Sensor", 0), std::ptr::null_mut());
    }

    #[test]
    fn test_remove_reuse() {
        let mut r = Registry::default();
        r.put("A", p(1));
        r.put("A", p(2));
        r.put("A", p(3));
        r.remove(p(2)).unwrap();
        assert_eq!(r.get_id(p(2)), 0);
        // The freed slot is recycled smallest-first
        assert_eq!(r.put("A", p(4)), 2);
        assert!(r.remove(p(2)).is_err());
    }

    #[test]
    fn test_trim() {
        let mut r = Registry::default();
        r.put("A", p(1));
        r.put("A", p(2));
        r.remove(p(2)).unwrap();
        r.trim();
        assert_eq!(r.get_max("A"), 1);
        r.remove(p(1)).unwrap();
        r.trim();
        assert_eq!(r.get_max("A"), 0);
    }
}
