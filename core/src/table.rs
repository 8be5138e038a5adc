//! Ground-truth operation table and held-out partition.
//!
//! The table is a pure function of (modulus, operation). The train/valid
//! partition is drawn from a caller-owned random source: rank every cell by a
//! random permutation, keep a cell for training iff its rank is strictly above
//! `frac_held_out * mod^2`. Valid is the exact complement of train.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Serialize, Deserialize};

use crate::error::ConfigError;

/// Closed-form binary operation over Z/mod. Both are symmetric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "sum")]
    Sum,
    #[serde(rename = "ssq", alias = "sum-of-squares", alias = "sum_of_squares")]
    SumOfSquares,
}

impl Operation {
    pub fn apply(self, a: usize, b: usize, modulus: usize) -> usize {
        match self {
            Operation::Sum => (a + b) % modulus,
            Operation::SumOfSquares => {
                let (a, b, m) = (a as u64, b as u64, modulus as u64);
                ((a * a + b * b) % m) as usize
            }
        }
    }

    /// Short tag used in run names.
    pub fn tag(self) -> &'static str {
        match self {
            Operation::Sum => "sum",
            Operation::SumOfSquares => "ssq",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Operation::Sum),
            "ssq" | "sum-of-squares" | "sum_of_squares" => Ok(Operation::SumOfSquares),
            other => Err(ConfigError::UnknownOperation(other.to_string())),
        }
    }
}

/// Square `n x n` matrix, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid<T> {
    n: usize,
    data: Vec<T>,
}

impl<T: Copy> Grid<T> {
    pub fn from_fn(n: usize, f: impl Fn(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(n * n);
        for a in 0..n {
            for b in 0..n {
                data.push(f(a, b));
            }
        }
        Grid { n, data }
    }

    pub fn side(&self) -> usize {
        self.n
    }

    pub fn get(&self, a: usize, b: usize) -> T {
        self.data[a * self.n + b]
    }

    /// Flat row-major view.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Grid<U> {
        Grid { n: self.n, data: self.data.iter().map(|&v| f(v)).collect() }
    }
}

pub type Mask = Grid<bool>;

impl Mask {
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&m| m).count()
    }

    /// Flat indices of all true cells.
    pub fn true_indices(&self) -> Vec<usize> {
        self.data.iter().enumerate().filter(|(_, &m)| m).map(|(i, _)| i).collect()
    }

    pub fn complement(&self) -> Mask {
        self.map(|m| !m)
    }
}

/// Row identity, column identity and operation result for every cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordGrids {
    pub x: Grid<usize>,
    pub y: Grid<usize>,
    pub z: Grid<usize>,
}

impl CoordGrids {
    /// Copy shifted into another id range (alias space uses `by = mod`).
    pub fn offset(&self, by: usize) -> CoordGrids {
        CoordGrids {
            x: self.x.map(|v| v + by),
            y: self.y.map(|v| v + by),
            z: self.z.map(|v| v + by),
        }
    }
}

/// Output of the table generator for one phase.
#[derive(Clone, Debug)]
pub struct TableSplit {
    pub coords: CoordGrids,
    pub train: Mask,
    pub valid: Mask,
}

/// `table[a][b] = op(a, b) mod m`.
pub fn operation_table(modulus: usize, op: Operation) -> Grid<usize> {
    Grid::from_fn(modulus, |a, b| op.apply(a, b, modulus))
}

/// Random train/valid partition of an `n x n` grid. Returns (train, valid).
pub fn held_out_masks<R: Rng + ?Sized>(
    n: usize,
    frac_held_out: f64,
    rng: &mut R,
) -> Result<(Mask, Mask), ConfigError> {
    if !(0.0..=1.0).contains(&frac_held_out) {
        return Err(ConfigError::FractionOutOfRange(frac_held_out));
    }
    let cells = n * n;
    let mut ranks: Vec<usize> = (0..cells).collect();
    ranks.shuffle(rng);
    let threshold = frac_held_out * cells as f64;
    let train = Grid { n, data: ranks.iter().map(|&r| r as f64 > threshold).collect() };
    let valid = train.complement();
    debug_assert!(train.data.iter().zip(&valid.data).all(|(t, v)| t ^ v));
    Ok((train, valid))
}

/// Build the table, its coordinate grids and a fresh train/valid partition.
pub fn make_table_masks<R: Rng + ?Sized>(
    modulus: usize,
    op: Operation,
    frac_held_out: f64,
    rng: &mut R,
) -> Result<TableSplit, ConfigError> {
    if modulus == 0 {
        return Err(ConfigError::ZeroModulus);
    }
    let coords = CoordGrids {
        x: Grid::from_fn(modulus, |a, _| a),
        y: Grid::from_fn(modulus, |_, b| b),
        z: operation_table(modulus, op),
    };
    let (train, valid) = held_out_masks(modulus, frac_held_out, rng)?;
    Ok(TableSplit { coords, train, valid })
}
