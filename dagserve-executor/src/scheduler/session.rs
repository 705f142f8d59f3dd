//! Session keys: the shard coordinates a sub-execution runs under.

use std::fmt;

/// One demultiplex level of a session: which demultiplexer, which shard,
/// out of how many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardCoord {
    /// Node index of the demultiplexer.
    pub demux: usize,
    /// Shard index within the fan-out.
    pub index: usize,
    /// Total shard count of the fan-out.
    pub count: usize,
}

/// The stack of shard coordinates tagging one sub-execution.
///
/// The root session (no demultiplexer above) is empty. Every demultiplexer
/// a node executes under pushes one coordinate; the matching gather pops
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SessionKey(Vec<ShardCoord>);

impl SessionKey {
    /// The root session.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Number of demultiplex levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Extend the session with one more shard coordinate.
    #[must_use]
    pub fn child(&self, demux: usize, index: usize, count: usize) -> Self {
        let mut coords = Vec::with_capacity(self.0.len() + 1);
        coords.extend_from_slice(&self.0);
        coords.push(ShardCoord { demux, index, count });
        Self(coords)
    }

    /// Split off the innermost coordinate.
    #[must_use]
    pub fn split_parent(&self) -> Option<(Self, ShardCoord)> {
        let (last, rest) = self.0.split_last()?;
        Some((Self(rest.to_vec()), *last))
    }

    /// Check whether `self` is a (possibly equal) prefix of `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Total number of sibling sub-executions at this depth: the product of
    /// all shard counts on the stack.
    #[must_use]
    pub fn shard_product(&self) -> u64 {
        self.0
            .iter()
            .map(|coord| coord.count as u64)
            .product()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("root");
        }
        let mut first = true;
        for coord in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}:{}/{}", coord.demux, coord.index, coord.count)?;
            first = false;
        }
        Ok(())
    }
}
