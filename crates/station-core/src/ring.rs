//! Round-robin assignment of work items to ranks.
//!
//! Items `[pset * num_per_pset, (pset + 1) * num_per_pset)` belong to one
//! pset. Each of `num_cores` ranks starts at its own item and strides by
//! `num_cores % num_per_pset`, so the ranks cover every item of the pset
//! without talking to each other.

use std::fmt;

use crate::error::SettingsError;

/// Work cursor for one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ring {
    first: u32,
    last: u32,
    increment: u32,
    start: u32,
    current: u32,
    num_cores: u32,
    num_per_pset: u32,
}

impl Ring {
    /// Cursor for `core` out of `num_cores`, over pset `pset`.
    pub fn new(
        pset: u32,
        num_per_pset: u32,
        core: u32,
        num_cores: u32,
    ) -> Result<Self, SettingsError> {
        if num_per_pset == 0 || num_cores == 0 {
            return Err(SettingsError::Invalid(format!(
                "ring needs at least one item and one core, got {num_per_pset} items, {num_cores} cores"
            )));
        }
        let first = pset
            .checked_mul(num_per_pset)
            .and_then(|first| first.checked_add(num_per_pset).map(|last| (first, last)));
        let Some((first, last)) = first else {
            return Err(SettingsError::Invalid(format!(
                "pset {pset} x {num_per_pset} items overflows"
            )));
        };
        let start = first + core % num_per_pset;
        Ok(Self {
            first,
            last,
            increment: num_cores % num_per_pset,
            start,
            current: start,
            num_cores,
            num_per_pset,
        })
    }

    /// Item this rank is on.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// First item of the pset.
    pub fn first(&self) -> u32 {
        self.first
    }

    /// One past the last item of the pset.
    pub fn last(&self) -> u32 {
        self.last
    }

    /// Step to this rank's next item and return it.
    pub fn advance(&mut self) -> u32 {
        let span = self.last - self.first;
        self.current = self.first + (self.current - self.first + self.increment) % span;
        self.current
    }

    /// Whether the current item is this rank's last one in the pass.
    pub fn is_last(&self) -> bool {
        self.current + self.increment >= self.last || self.num_cores >= self.num_per_pset
    }

    /// Return to the rank's starting item.
    pub fn reset(&mut self) {
        self.current = self.start;
    }

    /// Advance `blocks` times.
    pub fn skip_first_blocks(&mut self, blocks: usize) {
        for _ in 0..blocks {
            self.advance();
        }
    }

    /// Items visited from the current one until the cursor repeats.
    pub fn list(&self) -> Vec<u32> {
        self.iter().collect()
    }

    /// Iterate one full cycle without moving the cursor.
    pub fn iter(&self) -> Cycle {
        Cycle {
            ring: *self,
            origin: self.current,
            done: false,
        }
    }
}

impl<'a> IntoIterator for &'a Ring {
    type Item = u32;
    type IntoIter = Cycle;

    fn into_iter(self) -> Cycle {
        self.iter()
    }
}

/// One cycle of a [`Ring`], see [`Ring::iter`].
#[derive(Debug, Clone)]
pub struct Cycle {
    ring: Ring,
    origin: u32,
    done: bool,
}

impl Iterator for Cycle {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.done {
            return None;
        }
        let item = self.ring.current;
        if self.ring.advance() == self.origin {
            self.done = true;
        }
        Some(item)
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ring [{}..{}) at {} step {}",
            self.first, self.last, self.current, self.increment
        )
    }
}
