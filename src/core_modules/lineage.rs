// THEORY:
// The `lineage` module is the memory of the engine. It holds a chronologically
// ordered run of segmented frames together with the delta between every pair of
// neighbors, and answers lineage questions about individual cells: where did
// this cell come from, what did it become, what is its whole life.
//
// Key architectural principles:
// 1.  **Built Once**: The sequence links every adjacent pair at construction and
//     is immutable afterwards. `deltas[i]` always links frame i to frame i + 1.
// 2.  **Explicit Links**: A one-step answer is a `CellLink` (the neighboring
//     frame id, or none at a sequence boundary, plus the set of cell ids), never
//     a map mixing frame ids into cell keys.
// 3.  **Bounded Walks**: Recursive tree expansion tracks the (frame, cell) path
//     it is on and a depth limit equal to the number of frames. A repeat on the
//     path is reported as a cycle and a walk past the limit as a depth error.
//     Both are hard stops; a time-ordered sequence never triggers either.
//     Finished subtrees are kept per (frame, cell), so a split that later merges
//     again is expanded once.

use crate::core_modules::discrete_cells::DiscreteCells;
use crate::core_modules::labeling::Label;
use crate::core_modules::linker::{link_cells, FrameDelta, LinkError, OverlapBand};
use crate::core_modules::optical_flow::MotionEstimator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LineageError {
    #[error("frame '{0}' is not part of the sequence")]
    FrameNotFound(String),
    #[error("frame '{frame_id}' has no cell {cell_id}")]
    CellNotFound { frame_id: String, cell_id: Label },
    #[error("frame '{0}' appears more than once in the sequence")]
    DuplicateFrame(String),
    #[error("lineage of cell {cell_id} in frame '{frame_id}' loops back on itself")]
    CycleDetected { frame_id: String, cell_id: Label },
    #[error("lineage walk exceeded {limit} frames")]
    DepthExceeded { limit: usize },
    #[error("delta {position} does not link the frames around it")]
    DeltaMismatch { position: usize },
    #[error(transparent)]
    Link(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, LineageError>;

/// One step of lineage: the neighboring frame and the linked cells in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLink {
    /// `None` when the queried frame is at the sequence boundary.
    pub frame_id: Option<String>,
    pub cells: BTreeSet<Label>,
}

/// Nested lineage: the linked cells of one frame, each with its own lineage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageTree {
    /// Frame the `cells` belong to; `None` past the sequence boundary.
    pub frame_id: Option<String>,
    pub cells: BTreeMap<Label, LineageTree>,
}

impl LineageTree {
    fn boundary() -> Self {
        Self::default()
    }

    /// True when the tree has no linked cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The tree flattened by depth: one link per generation, nearest first.
    pub fn generations(&self) -> Vec<CellLink> {
        let mut generations = Vec::new();
        let mut current: Vec<&LineageTree> = vec![self];
        loop {
            let mut generation: Option<CellLink> = None;
            let mut next = Vec::new();
            for tree in &current {
                let Some(frame_id) = &tree.frame_id else {
                    continue;
                };
                if tree.cells.is_empty() {
                    continue;
                }
                let link = generation.get_or_insert_with(|| CellLink {
                    frame_id: Some(frame_id.clone()),
                    cells: BTreeSet::new(),
                });
                link.cells.extend(tree.cells.keys().copied());
                next.extend(tree.cells.values());
            }
            match generation {
                Some(link) => {
                    generations.push(link);
                    current = next;
                }
                None => break,
            }
        }
        generations
    }
}

/// The reconstructed lifetime of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub frame_id: String,
    pub cell_id: Label,
    /// Ancestors, walking back in time.
    pub parents: LineageTree,
    /// Descendants, walking forward in time.
    pub children: LineageTree,
}

impl Track {
    /// Number of frames the cell's lineage touches, its own frame included.
    pub fn frame_span(&self) -> usize {
        1 + self.parents.generations().len() + self.children.generations().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Parents,
    Children,
}

/// Depth-first lineage expansion over an arbitrary adjacency.
struct LineageWalk<'a, S> {
    frame_ids: &'a [String],
    step: S,
    limit: usize,
    path: Vec<(usize, Label)>,
    /// Finished subtrees with the number of levels they reach below their root.
    done: HashMap<(usize, Label), (LineageTree, usize)>,
}

impl<'a, S> LineageWalk<'a, S>
where
    S: Fn(usize, Label) -> Option<(usize, BTreeSet<Label>)>,
{
    fn new(frame_ids: &'a [String], step: S, limit: usize) -> Self {
        Self {
            frame_ids,
            step,
            limit,
            path: Vec::new(),
            done: HashMap::new(),
        }
    }

    fn expand(&mut self, position: usize, cell_id: Label) -> Result<LineageTree> {
        self.expand_node(position, cell_id).map(|(tree, _)| tree)
    }

    fn expand_node(&mut self, position: usize, cell_id: Label) -> Result<(LineageTree, usize)> {
        if self.path.len() >= self.limit {
            return Err(LineageError::DepthExceeded { limit: self.limit });
        }
        if let Some((tree, reach)) = self.done.get(&(position, cell_id)) {
            if self.path.len() + reach >= self.limit {
                return Err(LineageError::DepthExceeded { limit: self.limit });
            }
            return Ok((tree.clone(), *reach));
        }
        let Some((next_position, cells)) = (self.step)(position, cell_id) else {
            return Ok((LineageTree::boundary(), 0));
        };

        self.path.push((position, cell_id));
        let mut tree = LineageTree {
            frame_id: Some(self.frame_ids[next_position].clone()),
            cells: BTreeMap::new(),
        };
        let mut reach = 0;
        for next_cell in cells {
            if self.path.contains(&(next_position, next_cell)) {
                return Err(LineageError::CycleDetected {
                    frame_id: self.frame_ids[next_position].clone(),
                    cell_id: next_cell,
                });
            }
            let (subtree, below) = self.expand_node(next_position, next_cell)?;
            reach = reach.max(below + 1);
            tree.cells.insert(next_cell, subtree);
        }
        self.path.pop();
        self.done.insert((position, cell_id), (tree.clone(), reach));
        Ok((tree, reach))
    }
}

/// A chronologically ordered, fully linked run of frames.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    frames: Vec<DiscreteCells>,
    frame_ids: Vec<String>,
    positions: HashMap<String, usize>,
    deltas: Vec<FrameDelta>,
}

impl FrameSequence {
    /// Links every adjacent pair of `frames` (oldest first).
    pub fn new(frames: Vec<DiscreteCells>, estimator: &dyn MotionEstimator, band: &OverlapBand) -> Result<Self> {
        let deltas = frames
            .windows(2)
            .map(|pair| link_cells(&pair[0], &pair[1], estimator, band))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_parts(frames, deltas)
    }

    /// Assembles a sequence from frames and deltas that were linked elsewhere.
    ///
    /// `deltas[i]` must link `frames[i]` to `frames[i + 1]`.
    pub fn from_parts(frames: Vec<DiscreteCells>, deltas: Vec<FrameDelta>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(frames.len());
        for (position, frame) in frames.iter().enumerate() {
            if positions.insert(frame.frame_id.clone(), position).is_some() {
                return Err(LineageError::DuplicateFrame(frame.frame_id.clone()));
            }
        }

        if deltas.len() != frames.len().saturating_sub(1) {
            return Err(LineageError::DeltaMismatch {
                position: deltas.len().min(frames.len().saturating_sub(1)),
            });
        }
        for (position, delta) in deltas.iter().enumerate() {
            if delta.previous_frame_id != frames[position].frame_id
                || delta.next_frame_id != frames[position + 1].frame_id
            {
                return Err(LineageError::DeltaMismatch { position });
            }
        }

        let frame_ids: Vec<String> = frames.iter().map(|f| f.frame_id.clone()).collect();
        info!(
            frames = frames.len(),
            links = deltas.iter().map(FrameDelta::link_count).sum::<usize>(),
            "built frame sequence"
        );

        Ok(Self {
            frames,
            frame_ids,
            positions,
            deltas,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame ids in chronological order.
    pub fn frame_ids(&self) -> &[String] {
        &self.frame_ids
    }

    pub fn deltas(&self) -> &[FrameDelta] {
        &self.deltas
    }

    /// Chronological position of `frame_id`.
    pub fn frame_index(&self, frame_id: &str) -> Result<usize> {
        self.positions
            .get(frame_id)
            .copied()
            .ok_or_else(|| LineageError::FrameNotFound(frame_id.to_string()))
    }

    pub fn get_frame(&self, frame_id: &str) -> Result<&DiscreteCells> {
        Ok(&self.frames[self.frame_index(frame_id)?])
    }

    /// Cells of the previous frame that `cell_id` continues.
    pub fn get_cell_parents(&self, frame_id: &str, cell_id: Label) -> Result<CellLink> {
        let position = self.locate(frame_id, cell_id)?;
        Ok(self.link(Direction::Parents, position, cell_id))
    }

    /// Cells of the next frame that continue `cell_id`.
    pub fn get_cell_children(&self, frame_id: &str, cell_id: Label) -> Result<CellLink> {
        let position = self.locate(frame_id, cell_id)?;
        Ok(self.link(Direction::Children, position, cell_id))
    }

    /// Every ancestor of `cell_id`, nested by frame.
    pub fn get_cell_parents_tree(&self, frame_id: &str, cell_id: Label) -> Result<LineageTree> {
        let position = self.locate(frame_id, cell_id)?;
        self.tree(Direction::Parents, position, cell_id)
    }

    /// Every descendant of `cell_id`, nested by frame.
    pub fn get_cell_children_tree(&self, frame_id: &str, cell_id: Label) -> Result<LineageTree> {
        let position = self.locate(frame_id, cell_id)?;
        self.tree(Direction::Children, position, cell_id)
    }

    /// Ancestors and descendants of `cell_id`.
    pub fn get_track(&self, frame_id: &str, cell_id: Label) -> Result<Track> {
        let position = self.locate(frame_id, cell_id)?;
        let track = Track {
            frame_id: frame_id.to_string(),
            cell_id,
            parents: self.tree(Direction::Parents, position, cell_id)?,
            children: self.tree(Direction::Children, position, cell_id)?,
        };
        debug!(frame_id, cell_id, span = track.frame_span(), "reconstructed track");
        Ok(track)
    }

    fn locate(&self, frame_id: &str, cell_id: Label) -> Result<usize> {
        let position = self.frame_index(frame_id)?;
        if !self.frames[position].contains_cell(cell_id) {
            return Err(LineageError::CellNotFound {
                frame_id: frame_id.to_string(),
                cell_id,
            });
        }
        Ok(position)
    }

    /// Neighboring position and linked cells, `None` at the boundary.
    fn step(&self, direction: Direction, position: usize, cell_id: Label) -> Option<(usize, BTreeSet<Label>)> {
        match direction {
            Direction::Parents => {
                let previous = position.checked_sub(1)?;
                Some((previous, self.deltas[previous].parents_of(cell_id)))
            }
            Direction::Children => {
                let delta = self.deltas.get(position)?;
                Some((position + 1, delta.children_of(cell_id)))
            }
        }
    }

    fn link(&self, direction: Direction, position: usize, cell_id: Label) -> CellLink {
        match self.step(direction, position, cell_id) {
            Some((neighbor, cells)) => CellLink {
                frame_id: Some(self.frame_ids[neighbor].clone()),
                cells,
            },
            None => CellLink::default(),
        }
    }

    fn tree(&self, direction: Direction, position: usize, cell_id: Label) -> Result<LineageTree> {
        let mut walk = LineageWalk::new(&self.frame_ids, |p: usize, c: Label| self.step(direction, p, c), self.frames.len());
        walk.expand(position, cell_id)
    }
}
