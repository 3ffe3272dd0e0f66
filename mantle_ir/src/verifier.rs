//! Structural verifier for method bodies.
//!
//! Collects all errors rather than stopping at the first one. Lowering
//! runs this in debug builds after rewriting a body; tests use it to pin
//! down the region and node invariants.

use std::collections::HashSet;
use std::fmt;

use crate::body::MethodBody;
use crate::value::{BlockId, EhIndex, NodeId};

/// Location context for a verification error.
#[derive(Debug, Clone)]
pub enum Location {
    Body,
    Block(BlockId),
    Node(BlockId, NodeId),
    Region(EhIndex),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Body => write!(f, "body"),
            Location::Block(b) => write!(f, "{b}"),
            Location::Node(b, n) => write!(f, "{b}, {n}"),
            Location::Region(r) => write!(f, "{r}"),
        }
    }
}

/// A single verification error.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub location: Location,
    pub message: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.location, self.message)
    }
}

/// Collected verification results.
#[derive(Debug, Default)]
pub struct VerifyResult {
    pub errors: Vec<VerifyError>,
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, location: Location, message: impl Into<String>) {
        self.errors.push(VerifyError {
            location,
            message: message.into(),
        });
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "verification passed");
        }
        writeln!(f, "verification failed with {} error(s):", self.errors.len())?;
        for e in &self.errors {
            writeln!(f, "  {e}")?;
        }
        Ok(())
    }
}

/// Verify a method body's structural invariants.
pub fn verify(body: &MethodBody) -> VerifyResult {
    let mut result = VerifyResult::default();
    verify_blocks(body, &mut result);
    verify_eh_table(body, &mut result);
    result
}

fn verify_blocks(body: &MethodBody, result: &mut VerifyResult) {
    let eh_count = body.eh_table.len() as u32;
    let mut placed: HashSet<NodeId> = HashSet::new();

    for block_id in body.block_ids() {
        let block = body.block(block_id);

        if let Some(try_index) = block.try_index {
            if try_index.index() >= eh_count {
                result.error(Location::Block(block_id), "try index out of range");
            }
        }
        if let Some(hnd_index) = block.hnd_index {
            if hnd_index.index() >= eh_count {
                result.error(Location::Block(block_id), "handler index out of range");
            }
        }

        for (pos, &node_id) in block.nodes.iter().enumerate() {
            if node_id.index() as usize >= body.node_count() {
                result.error(Location::Node(block_id, node_id), "node id out of range");
                continue;
            }
            if !placed.insert(node_id) {
                result.error(
                    Location::Node(block_id, node_id),
                    "node placed in more than one position",
                );
            }

            // Every operand must be an earlier node of the same block.
            let mut operands = Vec::new();
            body.node(node_id).op.operands(&mut operands);
            for operand in operands {
                match block.nodes.iter().position(|&n| n == operand) {
                    Some(def_pos) if def_pos < pos => {}
                    Some(_) => result.error(
                        Location::Node(block_id, node_id),
                        format!("operand {operand} does not precede its user"),
                    ),
                    None => result.error(
                        Location::Node(block_id, node_id),
                        format!("operand {operand} not in the user's block"),
                    ),
                }
            }

            let node = body.node(node_id);
            if node.marked {
                result.error(
                    Location::Node(block_id, node_id),
                    "transient mark bit left set",
                );
            }
        }
    }
}

fn verify_eh_table(body: &MethodBody, result: &mut VerifyResult) {
    let count = body.eh_table.len() as u32;
    let mut try_begins: HashSet<BlockId> = HashSet::new();

    for (i, region) in body.eh_table.iter().enumerate() {
        let index = EhIndex(i as u32);

        // No two regions may share the same first try block.
        if !try_begins.insert(region.try_first) {
            result.error(
                Location::Region(index),
                format!("try region begins at {} shared with another region", region.try_first),
            );
        }

        // The table is ordered most- to least-nested: enclosing indices
        // must point at strictly later entries. This also rules out cycles.
        for enclosing in [region.enclosing_try, region.enclosing_hnd] {
            if let Some(enc) = enclosing {
                if enc.index() >= count {
                    result.error(Location::Region(index), "enclosing index out of range");
                } else if enc.index() <= i as u32 {
                    result.error(
                        Location::Region(index),
                        format!("enclosing index {enc} does not follow {index}"),
                    );
                }
            }
        }

        if matches!(region.kind, crate::eh::EhKind::Filter) && region.filter.is_none() {
            result.error(Location::Region(index), "filter region without filter block");
        }
    }
}
