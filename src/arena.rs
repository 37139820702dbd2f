use crate::error::{Result, RnnError};

/// An append-only, index-addressed store of per-timestep states, reused
/// across sequences to avoid reallocation.
///
/// Indices are acquired in order starting from zero; a shorter follow-up
/// sequence simply leaves the tail instances idle. Neighbor access is done
/// through the splitting accessors so a timestep and its neighbor can be
/// borrowed together without aliasing.
#[derive(Debug, Clone, Default)]
pub struct StateArena<C> {
    states: Vec<C>,
    last_state: Option<usize>,
    fresh: usize,
}

impl<C> StateArena<C> {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            last_state: None,
            fresh: 0,
        }
    }

    /// Timesteps in use by the current sequence.
    pub fn in_use(&self) -> usize {
        self.last_state.map_or(0, |i| i + 1)
    }

    pub fn last_state(&self) -> Option<usize> {
        self.last_state
    }

    /// Instances allocated fresh during the current sequence. Zero means the
    /// whole sequence ran on reused instances.
    pub fn allocations(&self) -> usize {
        self.fresh
    }

    /// Marks the start of a new sequence: all instances become reusable and
    /// the fresh-allocation count restarts.
    pub fn start_sequence(&mut self) {
        self.last_state = None;
        self.fresh = 0;
    }

    /// Releases every in-use instance back to the pool.
    pub fn release_all(&mut self) {
        self.last_state = None;
    }

    /// Hands out the instance at `index`, building it with `make` only when
    /// the pool has no instance there yet.
    pub fn acquire_with<F>(&mut self, index: usize, make: F) -> Result<&mut C>
    where
        F: FnOnce() -> Result<C>,
    {
        match index.cmp(&self.states.len()) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => {
                self.states.push(make()?);
                self.fresh += 1;
            }
            std::cmp::Ordering::Greater => {
                return Err(RnnError::StructuralMisuse(
                    "arena indices must be acquired in order",
                ));
            }
        }
        self.last_state = Some(index);
        Ok(&mut self.states[index])
    }

    /// The in-use instance at `index`. Idle tail instances are not readable.
    pub fn get(&self, index: usize) -> Result<&C> {
        if index >= self.in_use() {
            return Err(RnnError::StructuralMisuse(
                "timestep index beyond the current sequence",
            ));
        }
        Ok(&self.states[index])
    }

    /// The instance at `index` mutably, together with a read view of its
    /// predecessor.
    pub(crate) fn with_prev(&mut self, index: usize) -> Result<(Option<&C>, &mut C)> {
        if index >= self.in_use() {
            return Err(RnnError::StructuralMisuse(
                "timestep index beyond the current sequence",
            ));
        }
        let (before, rest) = self.states.split_at_mut(index);
        Ok((before.last().map(|c| &*c), &mut rest[0]))
    }

    /// Like [`with_prev`](Self::with_prev) but with the predecessor mutable
    /// as well, for writes into its relevance slots.
    pub(crate) fn with_prev_mut(&mut self, index: usize) -> Result<(Option<&mut C>, &mut C)> {
        if index >= self.in_use() {
            return Err(RnnError::StructuralMisuse(
                "timestep index beyond the current sequence",
            ));
        }
        let (before, rest) = self.states.split_at_mut(index);
        Ok((before.last_mut(), &mut rest[0]))
    }

    /// The instance at `index` mutably, together with a read view of its
    /// successor when the current sequence has one.
    pub(crate) fn with_next(&mut self, index: usize) -> Result<(&mut C, Option<&C>)> {
        let in_use = self.in_use();
        if index >= in_use {
            return Err(RnnError::StructuralMisuse(
                "timestep index beyond the current sequence",
            ));
        }
        let (upto, rest) = self.states.split_at_mut(index + 1);
        let next = if index + 1 < in_use {
            rest.first().map(|c| &*c)
        } else {
            None
        };
        Ok((&mut upto[index], next))
    }
}
