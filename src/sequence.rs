//! Ordered test programs.

use core::fmt;

use log::debug;

use crate::block::{AuthoringContext, BlockSpec, SequenceError, TestBlock};

/// Direction of a block move within the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards the start of the program.
    Up,
    /// Towards the end of the program.
    Down,
}

/// An ordered program of authored blocks.
///
/// Every mutation re-runs authoring; a failed mutation leaves the program
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence {
    blocks: Vec<TestBlock>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Author every spec in order. Fails on the first rejected block.
    pub fn from_specs<'a>(
        specs: impl IntoIterator<Item = &'a BlockSpec>,
        ctx: &AuthoringContext,
    ) -> Result<Self, SequenceError> {
        let mut sequence = Self::new();
        for spec in specs {
            sequence.append(spec, ctx)?;
        }
        Ok(sequence)
    }

    /// Add a block at the end and return its index.
    pub fn append(&mut self, spec: &BlockSpec, ctx: &AuthoringContext) -> Result<usize, SequenceError> {
        let block = TestBlock::author(spec, ctx)?;
        debug!("Appending block {}: {}", self.blocks.len() + 1, block);
        self.blocks.push(block);
        Ok(self.blocks.len() - 1)
    }

    /// Replace the block at `index`, validating as if it were new.
    pub fn replace(
        &mut self,
        index: usize,
        spec: &BlockSpec,
        ctx: &AuthoringContext,
    ) -> Result<(), SequenceError> {
        self.check_index(index)?;
        let block = TestBlock::author(spec, ctx)?;
        debug!("Replacing block {}: {}", index + 1, block);
        self.blocks[index] = block;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<TestBlock, SequenceError> {
        self.check_index(index)?;
        Ok(self.blocks.remove(index))
    }

    /// Swap a block with its neighbour. Returns the block's new index.
    ///
    /// Moving the first block up or the last block down is a no-op.
    pub fn move_block(&mut self, index: usize, direction: Direction) -> Result<usize, SequenceError> {
        self.check_index(index)?;
        let target = match direction {
            Direction::Up if index > 0 => index - 1,
            Direction::Down if index + 1 < self.blocks.len() => index + 1,
            _ => return Ok(index),
        };
        self.blocks.swap(index, target);
        Ok(target)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn get(&self, index: usize) -> Option<&TestBlock> {
        self.blocks.get(index)
    }

    pub fn first(&self) -> Option<&TestBlock> {
        self.blocks.first()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestBlock> {
        self.blocks.iter()
    }

    pub fn blocks(&self) -> &[TestBlock] {
        &self.blocks
    }

    /// Raw specs, e.g. for saving a program back to disk.
    pub fn specs(&self) -> Vec<BlockSpec> {
        self.blocks.iter().map(TestBlock::spec).collect()
    }

    /// Human readable listing, one line per block.
    pub fn description(&self) -> String {
        self.to_string()
    }

    fn check_index(&self, index: usize) -> Result<(), SequenceError> {
        if index < self.blocks.len() {
            Ok(())
        } else {
            Err(SequenceError::IndexOutOfRange {
                index,
                len: self.blocks.len(),
            })
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "Block {}: {}", i + 1, block)?;
        }
        Ok(())
    }
}
