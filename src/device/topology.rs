//! Grid coordinate → physical LED index mappings
//!
//! Panels are usually wired as one long strip folded back and forth, so the
//! N-th LED on the wire is rarely the N-th pixel in row-major order. A
//! [`Topology`] captures that wiring and is the only per-deployment piece the
//! encoder needs.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use crate::{Error, Result};

/// Maps `(x, y)` on a `width × height` grid to a position on the wire
///
/// Implementations must be a bijection from the grid onto
/// `[0, width * height)`; [`verify_topology`] checks this.
pub trait Topology: Send + Sync {
    fn index(&self, x: usize, y: usize, width: usize, height: usize) -> usize;

    /// Short name for logs
    fn name(&self) -> &str {
        "custom"
    }
}

/// Plain row-major order, every row left to right
#[derive(Debug, Clone, Copy, Default)]
pub struct RowMajor;

impl Topology for RowMajor {
    fn index(&self, x: usize, y: usize, width: usize, _height: usize) -> usize {
        y * width + x
    }

    fn name(&self) -> &str {
        "row-major"
    }
}

/// Rows zig-zag: even rows left to right, odd rows right to left
#[derive(Debug, Clone, Copy, Default)]
pub struct SerpentineRows;

impl Topology for SerpentineRows {
    fn index(&self, x: usize, y: usize, width: usize, _height: usize) -> usize {
        let offset = if y % 2 == 0 { x } else { width - 1 - x };
        y * width + offset
    }

    fn name(&self) -> &str {
        "serpentine-rows"
    }
}

/// Columns zig-zag: even columns top to bottom, odd columns bottom to top
///
/// This is the common layout for sheets built from vertical strips where
/// each pair of columns forms a U.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerpentineColumns;

impl Topology for SerpentineColumns {
    fn index(&self, x: usize, y: usize, _width: usize, height: usize) -> usize {
        let offset = if x % 2 == 0 { y } else { height - 1 - y };
        x * height + offset
    }

    fn name(&self) -> &str {
        "serpentine-columns"
    }
}

/// Wraps any closure as a topology
pub struct FnTopology<F> {
    name: String,
    f: F,
}

impl<F> FnTopology<F>
where
    F: Fn(usize, usize, usize, usize) -> usize + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Topology for FnTopology<F>
where
    F: Fn(usize, usize, usize, usize) -> usize + Send + Sync,
{
    fn index(&self, x: usize, y: usize, width: usize, height: usize) -> usize {
        (self.f)(x, y, width, height)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Config-selectable built-in topologies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    #[default]
    RowMajor,
    SerpentineRows,
    SerpentineColumns,
}

impl TopologyKind {
    #[must_use]
    pub fn build(self) -> Arc<dyn Topology> {
        match self {
            Self::RowMajor => Arc::new(RowMajor),
            Self::SerpentineRows => Arc::new(SerpentineRows),
            Self::SerpentineColumns => Arc::new(SerpentineColumns),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RowMajor => "row-major",
            Self::SerpentineRows => "serpentine-rows",
            Self::SerpentineColumns => "serpentine-columns",
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "row-major" | "linear" => Ok(Self::RowMajor),
            "serpentine-rows" | "zigzag-rows" => Ok(Self::SerpentineRows),
            "serpentine-columns" | "zigzag-columns" => Ok(Self::SerpentineColumns),
            other => Err(Error::Config(format!("unknown topology: {other}"))),
        }
    }
}

/// Check that `topology` maps the grid one-to-one onto `[0, width * height)`
///
/// # Errors
///
/// Returns `Config` naming the first coordinate that lands out of range or on
/// an index already taken
pub fn verify_topology(topology: &dyn Topology, width: usize, height: usize) -> Result<()> {
    let len = width * height;
    let mut owner: Vec<Option<(usize, usize)>> = vec![None; len];

    for y in 0..height {
        for x in 0..width {
            let index = topology.index(x, y, width, height);
            let Some(slot) = owner.get_mut(index) else {
                return Err(Error::Config(format!(
                    "topology {} maps ({x}, {y}) to {index}, outside 0..{len}",
                    topology.name()
                )));
            };
            if let Some((ox, oy)) = *slot {
                return Err(Error::Config(format!(
                    "topology {} maps both ({ox}, {oy}) and ({x}, {y}) to {index}",
                    topology.name()
                )));
            }
            *slot = Some((x, y));
        }
    }

    Ok(())
}

/// Wire index for every cell, laid out row-major
#[must_use]
pub fn index_map(topology: &dyn Topology, width: usize, height: usize) -> Vec<usize> {
    (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .map(|(x, y)| topology.index(x, y, width, height))
        .collect()
}
