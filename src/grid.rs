//! Work-grid partitioning.
//!
//! A kernel runs over a 2-D index space (the global extent) split into
//! equally sized work-groups (the tile, or local extent).  The tile must
//! divide the global extent exactly on both axes; a remainder is a
//! configuration defect and is rejected here, before anything reaches
//! the device.

use std::fmt;

use crate::error::{DispatchError, Result};

/// A 2-D extent, `x` along columns and `y` along rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent2 {
    pub x: u32,
    pub y: u32,
}

impl Extent2 {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Number of cells covered (`x * y`).
    pub fn area(&self) -> u64 {
        self.x as u64 * self.y as u64
    }
}

impl fmt::Display for Extent2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

impl std::str::FromStr for Extent2 {
    type Err = DispatchError;

    /// Parse `"WxH"`, e.g. `"4x4"`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || DispatchError::Config(format!("expected an extent like 4x4, got '{s}'"));
        let (x, y) = s.split_once(['x', 'X']).ok_or_else(bad)?;
        let x = x.trim().parse().map_err(|_| bad())?;
        let y = y.trim().parse().map_err(|_| bad())?;
        Ok(Self { x, y })
    }
}

/// How the tile extent is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileSpec {
    /// Caller-supplied tile.
    Fixed(Extent2),
    /// Split every axis of the global extent into `n` groups, so the tile
    /// is `global / n` per axis.
    Divide(u32),
    /// The kernel's own `@workgroup_size`.  Must be turned into a fixed
    /// tile with [`TileSpec::resolve`] once the entry point is known.
    Workgroup,
}

impl TileSpec {
    /// Replace [`TileSpec::Workgroup`] with the entry point's declared
    /// workgroup size.  Other variants are returned unchanged.
    pub fn resolve(self, workgroup_size: [u32; 3]) -> TileSpec {
        match self {
            TileSpec::Workgroup => {
                TileSpec::Fixed(Extent2::new(workgroup_size[0], workgroup_size[1]))
            }
            other => other,
        }
    }
}

/// A validated global/local extent pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGridSpec {
    global: Extent2,
    local: Extent2,
}

impl WorkGridSpec {
    /// Total problem size.
    pub fn global(&self) -> Extent2 {
        self.global
    }

    /// Per-group tile size.
    pub fn local(&self) -> Extent2 {
        self.local
    }

    /// Number of work-groups along each axis.
    pub fn groups(&self) -> Extent2 {
        Extent2::new(self.global.x / self.local.x, self.global.y / self.local.y)
    }

    /// Total number of work-groups.
    pub fn group_count(&self) -> u64 {
        self.groups().area()
    }
}

impl fmt::Display for WorkGridSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global {} / tile {} = {} groups", self.global, self.local, self.groups())
    }
}

/// Partition `global` into tiles chosen by `tile`.
///
/// Fails with [`DispatchError::Config`] when an extent is zero or the
/// tile does not divide the global extent on some axis.
pub fn compute_grid(global: Extent2, tile: TileSpec) -> Result<WorkGridSpec> {
    if global.x == 0 || global.y == 0 {
        return Err(DispatchError::Config(format!("global extent {global} is empty")));
    }
    let local = match tile {
        TileSpec::Fixed(local) => local,
        TileSpec::Divide(0) => {
            return Err(DispatchError::Config("cannot divide a grid into 0 groups".into()));
        }
        TileSpec::Divide(n) => {
            if global.x % n != 0 || global.y % n != 0 {
                return Err(DispatchError::Config(format!(
                    "global extent {global} is not divisible into {n} groups per axis"
                )));
            }
            Extent2::new(global.x / n, global.y / n)
        }
        TileSpec::Workgroup => {
            return Err(DispatchError::Config(
                "workgroup tile must be resolved against a kernel first".into(),
            ));
        }
    };
    if local.x == 0 || local.y == 0 {
        return Err(DispatchError::Config(format!("tile extent {local} is empty")));
    }
    if global.x % local.x != 0 || global.y % local.y != 0 {
        return Err(DispatchError::Config(format!(
            "tile {local} does not evenly divide global extent {global}"
        )));
    }
    Ok(WorkGridSpec { global, local })
}
