// At most one live session per physical address.
//
// Callers that share an instrument share the `Arc<Mutex<_>>` handed out here and lock it
// for the duration of a sweep; the sweep controller itself never locks anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::error::{Error, Result};

pub type SharedSession<S> = Arc<Mutex<S>>;

pub struct SessionRegistry<S> {
    sessions: HashMap<String, SharedSession<S>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self { sessions: HashMap::new() }
    }
}

// VISA resource strings are case-insensitive
fn key(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session already open for `address`, or open one with `open`.
    ///
    /// `open` is only called when no session exists; if it fails nothing is registered.
    pub fn acquire<F>(&mut self, address: &str, open: F) -> Result<SharedSession<S>>
    where
        F: FnOnce(&str) -> Result<S>,
    {
        let k: String = key(address);
        if let Some(existing) = self.sessions.get(&k) {
            return Ok(Arc::clone(existing));
        }

        let session: SharedSession<S> = Arc::new(Mutex::new(open(address.trim())?));
        info!("Opened instrument session at {}", address.trim());
        self.sessions.insert(k, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, address: &str) -> Option<SharedSession<S>> {
        self.sessions.get(&key(address)).map(Arc::clone)
    }

    /// Forget the session for `address`. Refused while any other handle to it is alive,
    /// so the next `acquire` can never open a second link to the same instrument.
    pub fn release(&mut self, address: &str) -> Result<()> {
        let k: String = key(address);
        let others: usize = match self.sessions.get(&k) {
            Some(session) => Arc::strong_count(session) - 1,
            None => return Err(Error::UnknownAddress(address.to_owned())),
        };
        if others > 0 {
            return Err(Error::SessionInUse { address: address.trim().to_owned(), handles: others });
        }

        self.sessions.remove(&k);
        info!("Released instrument session at {}", address.trim());
        Ok(())
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut v: Vec<String> = self.sessions.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn acquire_is_find_or_create() {
        let opened = Cell::new(0);
        let mut reg: SessionRegistry<u32> = SessionRegistry::new();

        let a = reg
            .acquire("TCPIP0::vna::inst0::INSTR", |_| {
                opened.set(opened.get() + 1);
                Ok(7)
            })
            .unwrap();
        let b = reg
            .acquire(" tcpip0::VNA::inst0::instr ", |_| {
                opened.set(opened.get() + 1);
                Ok(8)
            })
            .unwrap();

        assert_eq!(opened.get(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b.lock().unwrap(), 7);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn failed_open_registers_nothing() {
        let mut reg: SessionRegistry<u32> = SessionRegistry::new();
        let res = reg.acquire("10.0.0.9", |_| Err(Error::invalid("address", "unreachable")));
        assert!(res.is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn release_then_reacquire_opens_fresh_session() {
        let mut reg: SessionRegistry<u32> = SessionRegistry::new();
        let first = reg.acquire("10.0.0.9", |_| Ok(1)).unwrap();
        drop(first);
        reg.release("10.0.0.9").unwrap();
        assert!(reg.get("10.0.0.9").is_none());

        let second = reg.acquire("10.0.0.9", |_| Ok(2)).unwrap();
        assert_eq!(*second.lock().unwrap(), 2);
        assert_eq!(reg.addresses(), vec!["10.0.0.9".to_owned()]);
    }

    #[test]
    fn release_is_refused_while_a_handle_is_held() {
        let opened = Cell::new(0);
        let mut reg: SessionRegistry<u32> = SessionRegistry::new();
        let open = |_: &str| -> Result<u32> {
            opened.set(opened.get() + 1);
            Ok(opened.get())
        };

        let held = reg.acquire("TCPIP0::vna::inst0::INSTR", open).unwrap();
        match reg.release("TCPIP0::vna::inst0::INSTR") {
            Err(Error::SessionInUse { handles, .. }) => assert_eq!(handles, 1),
            other => panic!("expected SessionInUse, got {:?}", other),
        }

        let again = reg.acquire("TCPIP0::vna::inst0::INSTR", open).unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(opened.get(), 1);

        drop(held);
        drop(again);
        reg.release("TCPIP0::vna::inst0::INSTR").unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn releasing_unknown_address_fails() {
        let mut reg: SessionRegistry<u32> = SessionRegistry::new();
        assert!(matches!(reg.release("nowhere"), Err(Error::UnknownAddress(_))));
    }
}
