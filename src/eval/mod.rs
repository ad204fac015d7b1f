//! Compilation of expression DAGs into clause tapes, and their evaluation
//!
//! An [`Evaluator`] owns a flat tape of clauses in rank order: the X, Y,
//! and Z inputs sit in the first three slots, constants follow, and every
//! remaining clause lives in the row for its rank.  Rows are evaluated in
//! order, so a clause always reads operand buffers that were written
//! earlier in the same pass.
//!
//! Interval evaluation doubles as a pruning oracle: `min` / `max` clauses
//! record which operand wins over the current input box, and
//! [`Evaluator::push`] disables every clause that no longer influences the
//! root.  `push` / `pop` nest like a stack, mirroring recursive spatial
//! subdivision.
mod choice;
mod clause;
mod kernels;
#[cfg(target_arch = "x86_64")]
mod simd;

pub use choice::Choice;
pub use clause::BATCH_SIZE;

use clause::Clause;

use crate::cache::{Cache, Id, Tree};
use crate::error::Error;
use crate::opcode::Opcode;
use crate::types::Interval;

use log::{debug, trace};
use nalgebra::{Matrix4, Vector3};
use std::collections::HashMap;

/// All clauses of a single rank, evaluated as one sweep
///
/// `clauses` holds tape indices; the enabled ones are kept in
/// `[0..active)`, and `saved` remembers previous counts across `push`.
struct Row {
    clauses: Vec<u32>,
    active: usize,
    saved: Vec<usize>,
}

impl Row {
    fn new() -> Self {
        Self {
            clauses: vec![],
            active: 0,
            saved: vec![],
        }
    }
}

/// A compiled evaluator for a single expression DAG
///
/// The evaluator owns all of its scratch storage and may be sent to a
/// worker thread; parallel rendering builds one evaluator per worker.
/// Calls into a single evaluator must be serialized by the caller, since
/// every evaluation overwrites the tape's batch buffers.
pub struct Evaluator {
    /// Clause tape: X, Y, Z, then constants, then rank-ordered clauses
    tape: Vec<Clause>,
    rows: Vec<Row>,
    /// Tape index of the clause whose buffers hold the output
    root: u32,
    /// World-to-evaluator transform and its inverse
    mat: Matrix4<f32>,
    mat_inv: Matrix4<f32>,
    /// `mat` is the identity, so the point transform can be skipped
    identity: bool,
    /// Current push depth
    depth: usize,
    /// AVX was detected at construction
    use_avx: bool,
}

impl Evaluator {
    /// Compiles the given tree, evaluating in world coordinates
    pub fn new(cache: &mut Cache, tree: Tree) -> Result<Self, Error> {
        Self::new_transformed(cache, tree, Matrix4::identity())
    }

    /// Compiles the given tree with a world-to-evaluator transform
    ///
    /// Point and interval inputs are mapped through `mat` before
    /// evaluation, and gradients are mapped back through the linear part
    /// of its inverse.  A non-invertible matrix leaves gradients
    /// untransformed.
    pub fn new_transformed(
        cache: &mut Cache,
        tree: Tree,
        mat: Matrix4<f32>,
    ) -> Result<Self, Error> {
        let root = tree.collapse(cache)?.root();
        let connected = cache.find_connected(root)?;

        let mut tape = Vec::with_capacity(3 + connected.len());
        tape.push(Clause::new(Opcode::VarX, 0, 0));
        tape.push(Clause::new(Opcode::VarY, 1, 1));
        tape.push(Clause::new(Opcode::VarZ, 2, 2));

        // Input gradients never change
        tape[0].scratch.set_deriv(1.0, 0.0, 0.0);
        tape[1].scratch.set_deriv(0.0, 1.0, 0.0);
        tape[2].scratch.set_deriv(0.0, 0.0, 1.0);

        // Scan the cache in key order: constants arrive first, then
        // clauses in ascending rank, so operands always precede their
        // consumers in the tape.
        let mut clauses: HashMap<Id, u32> = HashMap::new();
        let mut rows: Vec<Row> = vec![];
        for (key, id) in cache.iter_keys() {
            if !connected.contains(&id) {
                continue;
            }
            match key.op {
                Opcode::Const => {
                    let slot = tape.len() as u32;
                    let mut c = Clause::new(Opcode::Const, slot, slot);
                    c.scratch.fill(f32::from_bits(key.value));
                    tape.push(c);
                    clauses.insert(id, slot);
                }
                Opcode::VarX => {
                    clauses.insert(id, 0);
                }
                Opcode::VarY => {
                    clauses.insert(id, 1);
                }
                Opcode::VarZ => {
                    clauses.insert(id, 2);
                }
                op => {
                    // `collapse` has already rewritten affine nodes
                    assert!(op != Opcode::Affine, "affine node in tape scan");

                    if matches!(op, Opcode::Pow | Opcode::NthRoot) {
                        let exp = key.rhs.ok_or(Error::InvalidOperand)?;
                        if cache.opcode(exp) != Some(Opcode::Const) {
                            return Err(Error::InvalidOperand);
                        }
                    }

                    let a = key.lhs.map(|n| clauses[&n]);
                    let b = key.rhs.map(|n| clauses[&n]);
                    let (a, b) = match (a, b) {
                        (Some(a), Some(b)) => (a, b),
                        (Some(a), None) => (a, a),
                        _ => unreachable!("operand missing for {op}"),
                    };

                    let slot = tape.len() as u32;
                    let rank = key.rank as usize;
                    while rows.len() < rank {
                        rows.push(Row::new());
                    }
                    rows[rank - 1].clauses.push(slot);
                    tape.push(Clause::new(op, a, b));
                    clauses.insert(id, slot);
                }
            }
        }
        for row in &mut rows {
            row.active = row.clauses.len();
        }

        let root = *clauses.get(&root).ok_or(Error::MalformedTree)?;

        let use_avx = {
            #[cfg(target_arch = "x86_64")]
            {
                std::arch::is_x86_feature_detected!("avx")
            }
            #[cfg(not(target_arch = "x86_64"))]
            {
                false
            }
        };

        debug!(
            "compiled tape with {} clauses in {} rows (avx: {use_avx})",
            tape.len(),
            rows.len(),
        );

        Ok(Self {
            tape,
            rows,
            root,
            mat,
            mat_inv: mat.try_inverse().unwrap_or_else(Matrix4::identity),
            identity: mat == Matrix4::identity(),
            depth: 0,
            use_avx,
        })
    }

    /// Returns the number of clauses in the tape
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    ////////////////////////////////////////////////////////////////////////

    /// Stores one world-space input point at the given batch index
    pub fn set_point(&mut self, x: f32, y: f32, z: f32, index: usize) {
        self.tape[0].scratch.f[index] = x;
        self.tape[1].scratch.f[index] = y;
        self.tape[2].scratch.f[index] = z;
    }

    /// Maps the first `count` input points into evaluator space
    ///
    /// Call this after [`set_point`](Self::set_point) and before a batch
    /// evaluation; it is a no-op when the transform is the identity.
    pub fn apply_transform(&mut self, count: usize) {
        if self.identity {
            return;
        }
        let m = self.mat;
        for i in 0..count {
            let x = self.tape[0].scratch.f[i];
            let y = self.tape[1].scratch.f[i];
            let z = self.tape[2].scratch.f[i];
            self.tape[0].scratch.f[i] =
                m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)] * z + m[(0, 3)];
            self.tape[1].scratch.f[i] =
                m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)] * z + m[(1, 3)];
            self.tape[2].scratch.f[i] =
                m[(2, 0)] * x + m[(2, 1)] * y + m[(2, 2)] * z + m[(2, 3)];
        }
    }

    /// Stores world-space interval inputs, applying the transform inline
    pub fn set_interval(&mut self, x: Interval, y: Interval, z: Interval) {
        let m = self.mat;
        self.tape[0].scratch.i = x * m[(0, 0)]
            + y * m[(0, 1)]
            + z * m[(0, 2)]
            + Interval::from(m[(0, 3)]);
        self.tape[1].scratch.i = x * m[(1, 0)]
            + y * m[(1, 1)]
            + z * m[(1, 2)]
            + Interval::from(m[(1, 3)]);
        self.tape[2].scratch.i = x * m[(2, 0)]
            + y * m[(2, 1)]
            + z * m[(2, 2)]
            + Interval::from(m[(2, 3)]);
    }

    ////////////////////////////////////////////////////////////////////////

    /// Evaluates the expression at a single world-space point
    pub fn eval_point(&mut self, x: f32, y: f32, z: f32) -> f32 {
        self.set_point(x, y, z, 0);
        self.apply_transform(1);
        self.values_batch(1, false)[0]
    }

    /// Evaluates the expression over a world-space interval region
    pub fn eval_interval(
        &mut self,
        x: Interval,
        y: Interval,
        z: Interval,
    ) -> Interval {
        self.set_interval(x, y, z);
        self.interval_pass()
    }

    /// Evaluates the first `count` input points, returning their values
    ///
    /// Inputs are staged with [`set_point`](Self::set_point) +
    /// [`apply_transform`](Self::apply_transform).  When `vectorize` is
    /// set (and AVX is available), runs the 8-lane kernels.
    ///
    /// # Panics
    /// If `count` exceeds [`BATCH_SIZE`]
    pub fn values_batch(&mut self, count: usize, vectorize: bool) -> &[f32] {
        assert!(count <= BATCH_SIZE, "batch of {count} > {BATCH_SIZE}");
        if vectorize && self.use_avx {
            #[cfg(target_arch = "x86_64")]
            self.values_avx(count.div_ceil(8));
        } else {
            self.values_scalar(count);
        }
        &self.tape[self.root as usize].scratch.f[..count]
    }

    /// Evaluates the first `count` input points, returning values and
    /// world-space gradients as `(v, dx, dy, dz)` slices
    ///
    /// # Panics
    /// If `count` exceeds [`BATCH_SIZE`]
    pub fn derivs_batch(
        &mut self,
        count: usize,
        vectorize: bool,
    ) -> (&[f32], &[f32], &[f32], &[f32]) {
        assert!(count <= BATCH_SIZE, "batch of {count} > {BATCH_SIZE}");
        if vectorize && self.use_avx {
            #[cfg(target_arch = "x86_64")]
            self.derivs_avx(count.div_ceil(8));
        } else {
            self.derivs_scalar(count);
        }

        // Gradients come out in evaluator space; map them back through
        // the inverse transform so callers see world-space normals
        if !self.identity {
            let mi = self.mat_inv;
            let s = &mut self.tape[self.root as usize].scratch;
            for i in 0..count {
                let n = mi.transform_vector(&Vector3::new(
                    s.dx[i], s.dy[i], s.dz[i],
                ));
                s.dx[i] = n.x;
                s.dy[i] = n.y;
                s.dz[i] = n.z;
            }
        }

        let s = &self.tape[self.root as usize].scratch;
        (
            &s.f[..count],
            &s.dx[..count],
            &s.dy[..count],
            &s.dz[..count],
        )
    }

    fn values_scalar(&mut self, count: usize) {
        let tape = &mut self.tape;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let i = ci as usize;
                let (prev, rest) = tape.split_at_mut(i);
                let c = &mut rest[0];
                let op = effective_op(c, prev);
                kernels::values(
                    op,
                    &prev[c.a as usize].scratch,
                    &prev[c.b as usize].scratch,
                    &mut c.scratch,
                    count,
                );
            }
        }
    }

    fn derivs_scalar(&mut self, count: usize) {
        let tape = &mut self.tape;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let i = ci as usize;
                let (prev, rest) = tape.split_at_mut(i);
                let c = &mut rest[0];
                let op = effective_op(c, prev);
                kernels::derivs(
                    op,
                    &prev[c.a as usize].scratch,
                    &prev[c.b as usize].scratch,
                    &mut c.scratch,
                    count,
                );
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn values_avx(&mut self, chunks: usize) {
        let tape = &mut self.tape;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let i = ci as usize;
                let (prev, rest) = tape.split_at_mut(i);
                let c = &mut rest[0];
                let op = effective_op(c, prev);
                // Safety: AVX support was checked at construction
                unsafe {
                    simd::values(
                        op,
                        &prev[c.a as usize].scratch,
                        &prev[c.b as usize].scratch,
                        &mut c.scratch,
                        chunks,
                    );
                }
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn derivs_avx(&mut self, chunks: usize) {
        let tape = &mut self.tape;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let i = ci as usize;
                let (prev, rest) = tape.split_at_mut(i);
                let c = &mut rest[0];
                let op = effective_op(c, prev);
                // Safety: AVX support was checked at construction
                unsafe {
                    simd::derivs(
                        op,
                        &prev[c.a as usize].scratch,
                        &prev[c.b as usize].scratch,
                        &mut c.scratch,
                        chunks,
                    );
                }
            }
        }
    }

    fn interval_pass(&mut self) -> Interval {
        let tape = &mut self.tape;
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                let i = ci as usize;
                let (prev, rest) = tape.split_at_mut(i);
                let c = &mut rest[0];
                let op = effective_op(c, prev);
                let a = prev[c.a as usize].scratch.i;
                let b = prev[c.b as usize].scratch.i;
                let (out, choice) = kernels::interval(op, a, b);
                c.scratch.i = out;
                // A dummy substitution must not clobber the recorded
                // choice; the pruned operand stays pruned on sub-regions
                if !matches!(op, Opcode::DummyA | Opcode::DummyB) {
                    c.choice = choice;
                }
            }
        }
        let out = self.tape[self.root as usize].scratch.i;
        trace!("interval pass produced {out}");
        out
    }

    ////////////////////////////////////////////////////////////////////////

    /// Disables every clause that cannot influence the root over the
    /// region of the most recent interval evaluation
    ///
    /// Must be balanced by exactly one [`pop`](Self::pop).
    pub fn push(&mut self) {
        let tape = &mut self.tape;

        // Every active clause starts out disabled...
        for row in &self.rows {
            for &ci in &row.clauses[..row.active] {
                tape[ci as usize].disabled = true;
            }
        }
        // ...except the root, which is always live
        tape[self.root as usize].disabled = false;

        // Walk from the highest rank down, enabling the operands that
        // each live clause still depends on
        for row in self.rows.iter().rev() {
            for &ci in &row.clauses[..row.active] {
                let i = ci as usize;
                let (prev, rest) = tape.split_at_mut(i);
                let c = &rest[0];
                if c.disabled {
                    continue;
                }
                match c.choice {
                    Choice::Both => {
                        prev[c.a as usize].disabled = false;
                        prev[c.b as usize].disabled = false;
                    }
                    Choice::Left => prev[c.a as usize].disabled = false,
                    Choice::Right => prev[c.b as usize].disabled = false,
                }
            }
        }

        // Permute each row so that enabled clauses come first, and
        // remember the previous count
        let tape = &self.tape;
        for row in &mut self.rows {
            row.saved.push(row.active);
            let live = &mut row.clauses[..row.active];
            live.sort_by_key(|&c| tape[c as usize].disabled);
            row.active =
                live.partition_point(|&c| !tape[c as usize].disabled);
        }
        self.depth += 1;

        trace!("push to depth {}", self.depth);
    }

    /// Restores the clause set saved by the matching [`push`](Self::push)
    pub fn pop(&mut self) -> Result<(), Error> {
        if self.depth == 0 {
            return Err(Error::UnbalancedStack);
        }
        self.depth -= 1;

        let tape = &mut self.tape;
        for row in &mut self.rows {
            // The permutation is left in place; order within the restored
            // prefix does not matter
            row.active = row.saved.pop().unwrap();
            for &ci in &row.clauses[..row.active] {
                tape[ci as usize].disabled = false;
            }
        }

        trace!("pop to depth {}", self.depth);
        Ok(())
    }

    /// Fraction of clauses currently enabled, across all rows
    ///
    /// 1.0 means no pruning; a tape with no rows reports 1.0.
    pub fn utilization(&self) -> f64 {
        let mut total = 0.0;
        let mut active = 0.0;
        for r in &self.rows {
            total += r.clauses.len() as f64;
            active += r.active as f64;
        }
        if total == 0.0 {
            1.0
        } else {
            active / total
        }
    }
}

/// Substitutes a dummy opcode when one of the operands has been pruned
fn effective_op(c: &Clause, prev: &[Clause]) -> Opcode {
    if prev[c.a as usize].disabled {
        Opcode::DummyB
    } else if prev[c.b as usize].disabled {
        Opcode::DummyA
    } else {
        c.op
    }
}
