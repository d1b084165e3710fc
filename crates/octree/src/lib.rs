//! Point octree used as the spatial index inside generated payloads.
//!
//! Elements live in flat arrays indexed by [`ElementId`]; nodes only store
//! indices into those arrays. Splitting a full leaf moves indices around but
//! never renumbers an element, so ids handed out by [`Octree::insert`] stay
//! valid for the lifetime of the tree.
//!
//! # Invariants
//! - Ids are dense insertion indices (`0..len`), so iteration order is insertion order.
//! - A tree is built once during generation and only read afterwards.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Stable handle to one element of an [`Octree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub u32);

impl ElementId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Leaf capacity and depth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OctreeConfig {
    /// A leaf holding this many elements splits on the next insert.
    pub split_threshold: usize,
    /// Leaves at this depth never split, so coincident points cannot recurse forever.
    pub max_depth: u32,
}

impl Default for OctreeConfig {
    fn default() -> Self {
        Self {
            split_threshold: 8,
            max_depth: 16,
        }
    }
}

/// Errors from octree construction.
#[derive(Debug, thiserror::Error)]
pub enum OctreeError {
    #[error("position {position} lies outside the octree bounds [{min}, {max})")]
    OutOfBounds {
        position: DVec3,
        min: DVec3,
        max: DVec3,
    },
    #[error("octree is full ({0} elements)")]
    Full(usize),
}

/// Borrowed view of one element.
#[derive(Debug)]
pub struct Element<'a, T> {
    pub id: ElementId,
    pub position: DVec3,
    pub value: &'a T,
}

impl<T> Clone for Element<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Element<'_, T> {}

/// Node counts for debugging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OctreeStats {
    pub branches: usize,
    pub leaves: usize,
    pub depth: u32,
}

#[derive(Debug)]
enum NodeKind {
    Leaf(Vec<u32>),
    Branch(Box<[Node; 8]>),
}

#[derive(Debug)]
struct Node {
    min: DVec3,
    max: DVec3,
    kind: NodeKind,
}

impl Node {
    fn leaf(min: DVec3, max: DVec3) -> Self {
        Self {
            min,
            max,
            kind: NodeKind::Leaf(Vec::new()),
        }
    }

    fn contains(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmplt(self.max).all()
    }

    fn intersects_sphere(&self, center: DVec3, radius: f64) -> bool {
        let closest = center.clamp(self.min, self.max);
        closest.distance_squared(center) <= radius * radius
    }

    fn octant(&self, p: DVec3) -> usize {
        let mid = (self.min + self.max) * 0.5;
        ((p.x >= mid.x) as usize) << 2 | ((p.y >= mid.y) as usize) << 1 | (p.z >= mid.z) as usize
    }

    fn octants(min: DVec3, max: DVec3) -> [Node; 8] {
        let mid = (min + max) * 0.5;
        std::array::from_fn(|i| {
            let upper = glam::BVec3::new(i & 4 != 0, i & 2 != 0, i & 1 != 0);
            Node::leaf(
                DVec3::select(upper, mid, min),
                DVec3::select(upper, max, mid),
            )
        })
    }

    fn insert(&mut self, index: u32, positions: &[DVec3], config: &OctreeConfig, depth: u32) {
        let octant = self.octant(positions[index as usize]);
        let overflow = match &mut self.kind {
            NodeKind::Leaf(items)
                if items.len() < config.split_threshold || depth >= config.max_depth =>
            {
                items.push(index);
                return;
            }
            NodeKind::Leaf(items) => std::mem::take(items),
            NodeKind::Branch(children) => {
                children[octant].insert(index, positions, config, depth + 1);
                return;
            }
        };

        tracing::trace!(depth, elements = overflow.len(), "splitting octree leaf");
        self.kind = NodeKind::Branch(Box::new(Self::octants(self.min, self.max)));
        for item in overflow.into_iter().chain(std::iter::once(index)) {
            let octant = self.octant(positions[item as usize]);
            if let NodeKind::Branch(children) = &mut self.kind {
                children[octant].insert(item, positions, config, depth + 1);
            }
        }
    }

    fn for_each_in_radius(
        &self,
        center: DVec3,
        radius: f64,
        positions: &[DVec3],
        f: &mut dyn FnMut(u32),
    ) {
        if !self.intersects_sphere(center, radius) {
            return;
        }
        match &self.kind {
            NodeKind::Leaf(items) => {
                for &item in items {
                    if positions[item as usize].distance_squared(center) <= radius * radius {
                        f(item);
                    }
                }
            }
            NodeKind::Branch(children) => {
                for child in children.iter() {
                    child.for_each_in_radius(center, radius, positions, f);
                }
            }
        }
    }

    fn gather_stats(&self, depth: u32, out: &mut OctreeStats) {
        out.depth = out.depth.max(depth);
        match &self.kind {
            NodeKind::Leaf(_) => out.leaves += 1,
            NodeKind::Branch(children) => {
                out.branches += 1;
                for child in children.iter() {
                    child.gather_stats(depth + 1, out);
                }
            }
        }
    }
}

/// Point-indexed octree over a fixed axis-aligned volume `[min, max)`.
#[derive(Debug)]
pub struct Octree<T> {
    config: OctreeConfig,
    root: Node,
    positions: Vec<DVec3>,
    values: Vec<T>,
}

impl<T> Octree<T> {
    /// Create an empty tree with the default config.
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self::with_config(OctreeConfig::default(), min, max)
    }

    pub fn with_config(config: OctreeConfig, min: DVec3, max: DVec3) -> Self {
        Self {
            config,
            root: Node::leaf(min, max),
            positions: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn config(&self) -> &OctreeConfig {
        &self.config
    }

    /// Bounds of the indexed volume as `(min, max)`.
    pub fn bounds(&self) -> (DVec3, DVec3) {
        (self.root.min, self.root.max)
    }

    /// Insert a value at `position` and return its id.
    pub fn insert(&mut self, position: DVec3, value: T) -> Result<ElementId, OctreeError> {
        if !self.root.contains(position) {
            return Err(OctreeError::OutOfBounds {
                position,
                min: self.root.min,
                max: self.root.max,
            });
        }
        let index = u32::try_from(self.positions.len())
            .map_err(|_| OctreeError::Full(self.positions.len()))?;
        self.positions.push(position);
        self.values.push(value);
        self.root.insert(index, &self.positions, &self.config, 0);
        Ok(ElementId(index))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: ElementId) -> Option<&T> {
        self.values.get(id.index())
    }

    pub fn position(&self, id: ElementId) -> Option<DVec3> {
        self.positions.get(id.index()).copied()
    }

    pub fn element(&self, id: ElementId) -> Option<Element<'_, T>> {
        let value = self.values.get(id.index())?;
        Some(Element {
            id,
            position: self.positions[id.index()],
            value,
        })
    }

    /// All elements in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = Element<'_, T>> {
        self.positions
            .iter()
            .zip(&self.values)
            .enumerate()
            .map(|(i, (position, value))| Element {
                id: ElementId(i as u32),
                position: *position,
                value,
            })
    }

    /// Visit every element within `radius` of `center` (inclusive).
    pub fn for_each_in_radius(&self, center: DVec3, radius: f64, mut f: impl FnMut(Element<'_, T>)) {
        self.root
            .for_each_in_radius(center, radius, &self.positions, &mut |index| {
                let i = index as usize;
                f(Element {
                    id: ElementId(index),
                    position: self.positions[i],
                    value: &self.values[i],
                });
            });
    }

    /// Ids of every element within `radius` of `center`, sorted.
    pub fn in_radius(&self, center: DVec3, radius: f64) -> Vec<ElementId> {
        let mut ids = Vec::new();
        self.for_each_in_radius(center, radius, |e| ids.push(e.id));
        ids.sort_unstable();
        ids
    }

    /// Closest element strictly inside the sphere, if any.
    pub fn nearest_in_radius(&self, center: DVec3, radius: f64) -> Option<Element<'_, T>> {
        let mut best: Option<(f64, ElementId)> = None;
        self.for_each_in_radius(center, radius, |e| {
            let d2 = e.position.distance_squared(center);
            if d2 < radius * radius && best.is_none_or(|(bd, _)| d2 < bd) {
                best = Some((d2, e.id));
            }
        });
        best.and_then(|(_, id)| self.element(id))
    }

    pub fn stats(&self) -> OctreeStats {
        let mut stats = OctreeStats::default();
        self.root.gather_stats(0, &mut stats);
        stats
    }
}
