//! The per-PEB entries and the containers that own them
//!
//! Every usable PEB has exactly one [WlEntry] in the arena, indexed by PEB number. The entry's
//! [Owner] says which container holds it; the containers themselves only hold `(ec, pnum)` keys
//! (or bare PEB numbers, for the protection queue), so moving an entry never invalidates anything.

use std::collections::BTreeSet;

use crate::{Error, Pnum, Result};

/// An erase-count-ordered set of PEBs
pub type EcTree = BTreeSet<(u64, Pnum)>;

/// Where an entry currently lives
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Owner {
    Free,
    Used,
    Scrub,
    Erroneous,

    /// In the given bucket of the protection queue
    Protected(usize),

    /// Being copied away by the wear-leveling mover
    MoveFrom,

    /// Being copied to by the wear-leveling mover
    MoveTo,

    /// Held by a pending (or running) erase job
    Erasing,
}

#[derive(Debug, Clone)]
pub struct WlEntry {
    pub pnum: Pnum,
    pub ec: u64,
    pub read_count: u64,
    pub owner: Owner,
}

#[derive(Debug)]
pub struct Registry {
    entries: Vec<Option<WlEntry>>,

    pub free: EcTree,
    pub used: EcTree,
    pub scrub: EcTree,
    pub erroneous: EcTree,

    /// Ring of protection buckets; `pq_head` is the next bucket to be released to `used`
    pq: Vec<Vec<Pnum>>,
    pq_head: usize,

    /// Always equal to `free.len()`
    pub free_count: u32,
}

impl Registry {
    pub fn new(peb_count: u32, prot_queue_len: usize) -> Self {
        Self {
            entries: vec![None; peb_count as usize],
            free: Default::default(),
            used: Default::default(),
            scrub: Default::default(),
            erroneous: Default::default(),
            pq: vec![vec![]; prot_queue_len],
            pq_head: 0,
            free_count: 0,
        }
    }

    pub fn get(&self, pnum: Pnum) -> Option<&WlEntry> {
        self.entries.get(pnum as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, pnum: Pnum) -> Option<&mut WlEntry> {
        self.entries.get_mut(pnum as usize)?.as_mut()
    }

    pub fn owner(&self, pnum: Pnum) -> Option<Owner> {
        self.get(pnum).map(|e| e.owner)
    }

    /// Iterate over every live entry, in PEB order
    pub fn iter(&self) -> impl Iterator<Item = &WlEntry> {
        self.entries.iter().flatten()
    }

    /// Create the entry for a PEB and hand it to `owner`
    pub fn insert(&mut self, pnum: Pnum, ec: u64, owner: Owner) -> Result<()> {
        let slot = self
            .entries
            .get_mut(pnum as usize)
            .ok_or(Error::OutOfRange(pnum))?;
        if slot.is_some() {
            return Err(Error::Invalid(format!("PEB {pnum} registered twice")));
        }
        *slot = Some(WlEntry {
            pnum,
            ec,
            read_count: 0,
            owner: Owner::Erasing,
        });
        self.attach(pnum, owner);
        Ok(())
    }

    /// Destroy an entry, wherever it lives
    pub fn remove(&mut self, pnum: Pnum) -> Option<WlEntry> {
        self.detach(pnum);
        self.entries.get_mut(pnum as usize)?.take()
    }

    /// Move an entry to another container
    pub fn move_to(&mut self, pnum: Pnum, owner: Owner) {
        self.detach(pnum);
        self.attach(pnum, owner);
    }

    /// Push an entry onto the tail bucket of the protection queue
    pub fn protect(&mut self, pnum: Pnum) {
        let tail = (self.pq_head + self.pq.len() - 1) % self.pq.len();
        self.move_to(pnum, Owner::Protected(tail));
    }

    /// Release the head bucket of the protection queue to `used` and advance the head
    pub fn serve_prot_queue(&mut self) {
        let bucket = std::mem::take(&mut self.pq[self.pq_head]);
        for pnum in bucket {
            self.attach(pnum, Owner::Used);
        }
        self.pq_head = (self.pq_head + 1) % self.pq.len();
    }

    /// Number of entries sitting in the protection queue
    pub fn protected_count(&self) -> usize {
        self.pq.iter().map(Vec::len).sum()
    }

    /// Take an entry out of its container, leaving it in limbo as [Owner::Erasing]
    fn detach(&mut self, pnum: Pnum) {
        let Some(entry) = self.get(pnum) else { return };
        let (key, owner) = ((entry.ec, pnum), entry.owner);
        match owner {
            Owner::Free => {
                self.free.remove(&key);
                self.free_count -= 1;
            }
            Owner::Used => {
                self.used.remove(&key);
            }
            Owner::Scrub => {
                self.scrub.remove(&key);
            }
            Owner::Erroneous => {
                self.erroneous.remove(&key);
            }
            Owner::Protected(bucket) => self.pq[bucket].retain(|&p| p != pnum),
            Owner::MoveFrom | Owner::MoveTo | Owner::Erasing => {}
        }
        if let Some(entry) = self.get_mut(pnum) {
            entry.owner = Owner::Erasing;
        }
    }

    /// Put a detached entry into a container
    fn attach(&mut self, pnum: Pnum, owner: Owner) {
        let Some(entry) = self.get_mut(pnum) else { return };
        entry.owner = owner;
        let key = (entry.ec, pnum);
        match owner {
            Owner::Free => {
                self.free.insert(key);
                self.free_count += 1;
            }
            Owner::Used => {
                self.used.insert(key);
            }
            Owner::Scrub => {
                self.scrub.insert(key);
            }
            Owner::Erroneous => {
                self.erroneous.insert(key);
            }
            Owner::Protected(bucket) => self.pq[bucket].push(pnum),
            Owner::MoveFrom | Owner::MoveTo | Owner::Erasing => {}
        }
    }

    /// Verify that every entry is held by exactly the container its owner names
    pub fn check(&self) -> Result<()> {
        let fail = |what: String| Err(Error::Invalid(format!("self-check failed: {what}")));

        if self.free_count as usize != self.free.len() {
            return fail(format!(
                "free_count {} but {} free entries",
                self.free_count,
                self.free.len()
            ));
        }

        let mut held = 0;
        for entry in self.iter() {
            let key = (entry.ec, entry.pnum);
            let ok = match entry.owner {
                Owner::Free => self.free.contains(&key),
                Owner::Used => self.used.contains(&key),
                Owner::Scrub => self.scrub.contains(&key),
                Owner::Erroneous => self.erroneous.contains(&key),
                Owner::Protected(bucket) => self.pq[bucket].contains(&entry.pnum),
                Owner::MoveFrom | Owner::MoveTo | Owner::Erasing => true,
            };
            if !ok {
                return fail(format!("PEB {} not in {:?}", entry.pnum, entry.owner));
            }
            if !matches!(
                entry.owner,
                Owner::MoveFrom | Owner::MoveTo | Owner::Erasing
            ) {
                held += 1;
            }
        }

        let total = self.free.len()
            + self.used.len()
            + self.scrub.len()
            + self.erroneous.len()
            + self.protected_count();
        if held != total {
            return fail(format!("{held} entries owned, {total} held by containers"));
        }

        Ok(())
    }
}
