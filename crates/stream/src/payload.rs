//! Generated cell content and the generator contracts that produce it.

use cosmos_common::CellCoord;
use cosmos_octree::{Element, ElementId, Octree, OctreeConfig};
use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Address of one element inside a cell payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChildId {
    pub cell: CellCoord,
    pub element: ElementId,
}

impl ChildId {
    pub fn new(cell: CellCoord, element: ElementId) -> Self {
        Self { cell, element }
    }

    /// Seed for the child's full generation, derived from its cell's seed.
    pub fn seed(&self, base: u64) -> u64 {
        cosmos_common::mix_seed(self.cell.seed(base), self.element.0 as u64)
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cell, self.element)
    }
}

/// Immutable content of one cell: cheap per-element info indexed by position.
#[derive(Debug)]
pub struct Payload<I> {
    coord: CellCoord,
    elements: Octree<I>,
}

impl<I> Payload<I> {
    pub fn new(coord: CellCoord, elements: Octree<I>) -> Self {
        Self { coord, elements }
    }

    /// A payload with no elements, indexed over the cell's bounds.
    pub fn empty(coord: CellCoord) -> Self {
        Self::new(coord, Octree::new(coord.min_bound(), coord.max_bound()))
    }

    /// Index `items` over the cell's bounds. Items outside the cell are
    /// dropped with a warning.
    pub fn build(
        coord: CellCoord,
        config: OctreeConfig,
        items: impl IntoIterator<Item = (DVec3, I)>,
    ) -> Self {
        let mut elements = Octree::with_config(config, coord.min_bound(), coord.max_bound());
        for (position, info) in items {
            if let Err(err) = elements.insert(position, info) {
                tracing::warn!(%coord, %err, "dropping element outside its cell");
            }
        }
        Self::new(coord, elements)
    }

    pub fn coord(&self) -> CellCoord {
        self.coord
    }

    pub fn elements(&self) -> &Octree<I> {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: ElementId) -> Option<&I> {
        self.elements.get(id)
    }

    pub fn element(&self, id: ElementId) -> Option<Element<'_, I>> {
        self.elements.element(id)
    }

    /// Child addresses of every element, in insertion order.
    pub fn child_ids(&self) -> impl Iterator<Item = ChildId> + '_ {
        self.elements.iter().map(|e| ChildId::new(self.coord, e.id))
    }
}

/// Produces the payload of one cell. Must be deterministic in `(coord, seed)`
/// and must not touch manager state.
pub trait CellGenerator: Send + Sync + 'static {
    type Info: Send + Sync + 'static;

    fn generate(&self, coord: CellCoord, seed: u64)
    -> Result<Payload<Self::Info>, GenerationError>;
}

/// Liveness and per-tick work of a fully generated child.
pub trait Nested: Send + Sync + 'static {
    /// Live references held inside this value; a child slot with any is not
    /// evicted.
    fn nested_references(&self) -> usize {
        0
    }

    fn tick(&self) {}
}

impl Nested for () {}

/// Produces the full value of one element of a parent payload.
pub trait ChildGenerator<I>: Send + Sync + 'static {
    type Full: Nested;

    fn generate(
        &self,
        parent: &Payload<I>,
        element: ElementId,
        seed: u64,
    ) -> Result<Self::Full, GenerationError>;
}

/// Child generator for managers whose cells have no expandable elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChildren;

impl<I> ChildGenerator<I> for NoChildren {
    type Full = ();

    fn generate(&self, _: &Payload<I>, _: ElementId, _: u64) -> Result<(), GenerationError> {
        Ok(())
    }
}
