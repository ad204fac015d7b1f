use crate::eval::Choice;
use crate::opcode::Opcode;
use crate::types::Interval;

/// Number of points evaluated in a single batch
///
/// Batch calls take any `n <= BATCH_SIZE`; callers chunk larger workloads.
pub const BATCH_SIZE: usize = 256;

/// Per-clause scratch buffers for one batch of evaluation
///
/// The 32-byte alignment keeps every buffer suitable for aligned 8-lane
/// loads; `repr(C)` then rounds the struct size up to a multiple of the
/// alignment, so buffers stay aligned when clauses are stored contiguously.
#[derive(Clone)]
#[repr(C, align(32))]
pub(crate) struct Scratch {
    /// Values
    pub f: [f32; BATCH_SIZE],
    /// Partial derivatives with respect to x, y, z
    pub dx: [f32; BATCH_SIZE],
    pub dy: [f32; BATCH_SIZE],
    pub dz: [f32; BATCH_SIZE],
    /// Result of the most recent interval pass
    pub i: Interval,
}

impl Scratch {
    fn new() -> Self {
        Self {
            f: [0.0; BATCH_SIZE],
            dx: [0.0; BATCH_SIZE],
            dy: [0.0; BATCH_SIZE],
            dz: [0.0; BATCH_SIZE],
            i: f32::NAN.into(),
        }
    }

    /// Fills every slot with a constant, including the interval
    pub fn fill(&mut self, v: f32) {
        self.f.fill(v);
        self.i = v.into();
    }

    /// Sets the derivative buffers to a fixed gradient
    pub fn set_deriv(&mut self, dx: f32, dy: f32, dz: f32) {
        self.dx.fill(dx);
        self.dy.fill(dy);
        self.dz.fill(dz);
    }
}

/// A compiled node in the evaluator's tape
///
/// Operands are tape indices and always point at lower slots (operands are
/// emplaced before their consumers).  A unary clause aliases `b` to `a`;
/// a nullary clause aliases both to its own slot, but is never executed by
/// a kernel.
pub(crate) struct Clause {
    pub op: Opcode,
    pub a: u32,
    pub b: u32,
    /// Operand choice recorded by the last interval pass
    pub choice: Choice,
    /// Set while the pruning stack has this clause turned off
    pub disabled: bool,
    pub scratch: Scratch,
}

impl Clause {
    pub fn new(op: Opcode, a: u32, b: u32) -> Self {
        Self {
            op,
            a,
            b,
            choice: Choice::default(),
            disabled: false,
            scratch: Scratch::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scratch_layout() {
        // Contiguous clauses must keep their buffers 32-byte aligned
        assert_eq!(std::mem::align_of::<Scratch>(), 32);
        assert_eq!(std::mem::size_of::<Scratch>() % 32, 0);

        let clauses = vec![
            Clause::new(Opcode::VarX, 0, 0),
            Clause::new(Opcode::VarY, 1, 1),
        ];
        for c in &clauses {
            assert_eq!(c.scratch.f.as_ptr() as usize % 32, 0);
        }
    }

    #[test]
    fn test_fill() {
        let mut c = Clause::new(Opcode::Const, 0, 0);
        c.scratch.fill(1.5);
        assert!(c.scratch.f.iter().all(|&v| v == 1.5));
        assert_eq!(c.scratch.i, 1.5.into());

        c.scratch.set_deriv(1.0, 0.0, 0.0);
        assert!(c.scratch.dx.iter().all(|&v| v == 1.0));
        assert!(c.scratch.dy.iter().all(|&v| v == 0.0));
    }
}
