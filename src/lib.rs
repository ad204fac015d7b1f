//! Infrastructure for evaluating implicit surface expression DAGs.
//!
//! Expressions are built in a [`Cache`], which deduplicates nodes and
//! applies affine canonicalization and a small set of algebraic
//! identities.  A [`Tree`] handle names a root inside the cache, and an
//! [`Evaluator`] compiles it into a flat, rank-ordered clause tape with
//! scalar, SIMD, and interval kernels.  During spatial subdivision,
//! [`Evaluator::push`] / [`Evaluator::pop`] prune subtrees that interval
//! arithmetic has proven irrelevant.
//!
//! ```
//! use isofield::{Cache, Evaluator, Tree};
//!
//! let mut cache = Cache::new();
//! let x = cache.x();
//! let y = cache.y();
//! let x2 = cache.square(x).unwrap();
//! let y2 = cache.square(y).unwrap();
//! let r2 = cache.add(x2, y2).unwrap();
//! let r = cache.sqrt(r2).unwrap();
//! let circle = cache.sub(r, 1.0).unwrap();
//!
//! let tree = Tree::new(&cache, circle).unwrap();
//! let mut eval = Evaluator::new(&mut cache, tree).unwrap();
//! for row in 0..8 {
//!     let y = 1.0 - (row as f32 + 0.5) / 4.0;
//!     for col in 0..16 {
//!         let x = (col as f32 + 0.5) / 8.0 - 1.0;
//!         if eval.eval_point(x, y, 0.0) <= 0.0 {
//!             print!("X");
//!         } else {
//!             print!(" ");
//!         }
//!     }
//!     println!();
//! }
//!
//! // This will print
//! //     XXXXXXXX
//! //   XXXXXXXXXXXX
//! //  XXXXXXXXXXXXXX
//! // XXXXXXXXXXXXXXXX
//! // XXXXXXXXXXXXXXXX
//! //  XXXXXXXXXXXXXX
//! //   XXXXXXXXXXXX
//! //     XXXXXXXX
//! ```
pub mod cache;
pub mod error;
pub mod eval;
pub mod opcode;
pub mod types;

pub use cache::{Cache, Id, IntoId, Tree};
pub use error::Error;
pub use eval::{Choice, Evaluator, BATCH_SIZE};
pub use opcode::Opcode;
pub use types::Interval;
