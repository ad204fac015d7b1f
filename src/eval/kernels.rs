//! Scalar kernels for the batch and interval evaluators
//!
//! Each kernel is one tight loop per opcode, reading the operands' scratch
//! buffers and writing its own.  The SIMD module falls back to these for
//! operations without 8-lane equivalents.
use super::choice::Choice;
use super::clause::Scratch;
use crate::opcode::Opcode;
use crate::types::Interval;

/// Evaluates `n` values of a single clause
pub(super) fn values(
    op: Opcode,
    a: &Scratch,
    b: &Scratch,
    out: &mut Scratch,
    n: usize,
) {
    let (av, bv) = (&a.f, &b.f);
    let o = &mut out.f;
    match op {
        Opcode::Add => {
            for i in 0..n {
                o[i] = av[i] + bv[i];
            }
        }
        Opcode::Mul => {
            for i in 0..n {
                o[i] = av[i] * bv[i];
            }
        }
        Opcode::Min => {
            for i in 0..n {
                o[i] = av[i].min(bv[i]);
            }
        }
        Opcode::Max => {
            for i in 0..n {
                o[i] = av[i].max(bv[i]);
            }
        }
        Opcode::Sub => {
            for i in 0..n {
                o[i] = av[i] - bv[i];
            }
        }
        Opcode::Div => {
            for i in 0..n {
                o[i] = av[i] / bv[i];
            }
        }
        Opcode::Atan2 => {
            for i in 0..n {
                o[i] = av[i].atan2(bv[i]);
            }
        }
        Opcode::Pow => {
            for i in 0..n {
                o[i] = av[i].powf(bv[i]);
            }
        }
        Opcode::NthRoot => {
            for i in 0..n {
                o[i] = av[i].powf(1.0 / bv[i]);
            }
        }
        Opcode::Mod => {
            for i in 0..n {
                o[i] = av[i].rem_euclid(bv[i]);
            }
        }
        Opcode::NanFill => {
            for i in 0..n {
                o[i] = if av[i].is_nan() { bv[i] } else { av[i] };
            }
        }

        Opcode::Square => {
            for i in 0..n {
                o[i] = av[i] * av[i];
            }
        }
        Opcode::Sqrt => {
            for i in 0..n {
                o[i] = av[i].sqrt();
            }
        }
        Opcode::Neg => {
            for i in 0..n {
                o[i] = -av[i];
            }
        }
        Opcode::Abs => {
            for i in 0..n {
                o[i] = av[i].abs();
            }
        }
        Opcode::Sin => {
            for i in 0..n {
                o[i] = av[i].sin();
            }
        }
        Opcode::Cos => {
            for i in 0..n {
                o[i] = av[i].cos();
            }
        }
        Opcode::Tan => {
            for i in 0..n {
                o[i] = av[i].tan();
            }
        }
        Opcode::Asin => {
            for i in 0..n {
                o[i] = av[i].asin();
            }
        }
        Opcode::Acos => {
            for i in 0..n {
                o[i] = av[i].acos();
            }
        }
        Opcode::Atan => {
            for i in 0..n {
                o[i] = av[i].atan();
            }
        }
        Opcode::Exp => {
            for i in 0..n {
                o[i] = av[i].exp();
            }
        }

        Opcode::DummyA => o[..n].copy_from_slice(&av[..n]),
        Opcode::DummyB => o[..n].copy_from_slice(&bv[..n]),

        _ => unreachable!("not a value opcode: {op}"),
    }
}

/// Evaluates `n` values and gradients of a single clause
pub(super) fn derivs(
    op: Opcode,
    a: &Scratch,
    b: &Scratch,
    out: &mut Scratch,
    n: usize,
) {
    // Evaluate the base operation in a single pass first
    values(op, a, b, out, n);

    let (av, adx, ady, adz) = (&a.f, &a.dx, &a.dy, &a.dz);
    let (bv, bdx, bdy, bdz) = (&b.f, &b.dx, &b.dy, &b.dz);
    let Scratch {
        f: ov,
        dx: odx,
        dy: ody,
        dz: odz,
        ..
    } = out;

    match op {
        Opcode::Add => {
            for i in 0..n {
                odx[i] = adx[i] + bdx[i];
                ody[i] = ady[i] + bdy[i];
                odz[i] = adz[i] + bdz[i];
            }
        }
        Opcode::Mul => {
            // Product rule
            for i in 0..n {
                odx[i] = av[i] * bdx[i] + adx[i] * bv[i];
                ody[i] = av[i] * bdy[i] + ady[i] * bv[i];
                odz[i] = av[i] * bdz[i] + adz[i] * bv[i];
            }
        }
        Opcode::Min => {
            // Gradient of the winning branch; ties go to b
            for i in 0..n {
                if av[i] < bv[i] {
                    odx[i] = adx[i];
                    ody[i] = ady[i];
                    odz[i] = adz[i];
                } else {
                    odx[i] = bdx[i];
                    ody[i] = bdy[i];
                    odz[i] = bdz[i];
                }
            }
        }
        Opcode::Max => {
            for i in 0..n {
                if av[i] > bv[i] {
                    odx[i] = adx[i];
                    ody[i] = ady[i];
                    odz[i] = adz[i];
                } else {
                    odx[i] = bdx[i];
                    ody[i] = bdy[i];
                    odz[i] = bdz[i];
                }
            }
        }
        Opcode::Sub => {
            for i in 0..n {
                odx[i] = adx[i] - bdx[i];
                ody[i] = ady[i] - bdy[i];
                odz[i] = adz[i] - bdz[i];
            }
        }
        Opcode::Div => {
            // Quotient rule
            for i in 0..n {
                let p = bv[i] * bv[i];
                odx[i] = (bv[i] * adx[i] - av[i] * bdx[i]) / p;
                ody[i] = (bv[i] * ady[i] - av[i] * bdy[i]) / p;
                odz[i] = (bv[i] * adz[i] - av[i] * bdz[i]) / p;
            }
        }
        Opcode::Atan2 => {
            for i in 0..n {
                let d = av[i] * av[i] + bv[i] * bv[i];
                odx[i] = (adx[i] * bv[i] - av[i] * bdx[i]) / d;
                ody[i] = (ady[i] * bv[i] - av[i] * bdy[i]) / d;
                odz[i] = (adz[i] * bv[i] - av[i] * bdz[i]) / d;
            }
        }
        Opcode::Pow => {
            // The exponent is required to be constant, so the
            // a^b·ln(a)·db/dx term is always zero and is skipped (ln(a)
            // would often be NaN anyway)
            for i in 0..n {
                let m = av[i].powf(bv[i] - 1.0);
                odx[i] = m * bv[i] * adx[i];
                ody[i] = m * bv[i] * ady[i];
                odz[i] = m * bv[i] * adz[i];
            }
        }
        Opcode::NthRoot => {
            for i in 0..n {
                let r = 1.0 / bv[i];
                let m = av[i].powf(r - 1.0);
                odx[i] = m * r * adx[i];
                ody[i] = m * r * ady[i];
                odz[i] = m * r * adz[i];
            }
        }
        Opcode::Mod => {
            // Not quite how partial derivatives of mod work, but close
            // enough for rendering normals
            for i in 0..n {
                odx[i] = adx[i];
                ody[i] = ady[i];
                odz[i] = adz[i];
            }
        }
        Opcode::NanFill => {
            for i in 0..n {
                let nan = av[i].is_nan();
                odx[i] = if nan { bdx[i] } else { adx[i] };
                ody[i] = if nan { bdy[i] } else { ady[i] };
                odz[i] = if nan { bdz[i] } else { adz[i] };
            }
        }

        Opcode::Square => {
            for i in 0..n {
                odx[i] = 2.0 * av[i] * adx[i];
                ody[i] = 2.0 * av[i] * ady[i];
                odz[i] = 2.0 * av[i] * adz[i];
            }
        }
        Opcode::Sqrt => {
            // Clamped to zero at non-positive inputs
            for i in 0..n {
                if av[i] <= 0.0 {
                    odx[i] = 0.0;
                    ody[i] = 0.0;
                    odz[i] = 0.0;
                } else {
                    let d = 2.0 * ov[i];
                    odx[i] = adx[i] / d;
                    ody[i] = ady[i] / d;
                    odz[i] = adz[i] / d;
                }
            }
        }
        Opcode::Neg => {
            for i in 0..n {
                odx[i] = -adx[i];
                ody[i] = -ady[i];
                odz[i] = -adz[i];
            }
        }
        Opcode::Abs => {
            for i in 0..n {
                if av[i] < 0.0 {
                    odx[i] = -adx[i];
                    ody[i] = -ady[i];
                    odz[i] = -adz[i];
                } else {
                    odx[i] = adx[i];
                    ody[i] = ady[i];
                    odz[i] = adz[i];
                }
            }
        }
        Opcode::Sin => {
            for i in 0..n {
                let c = av[i].cos();
                odx[i] = adx[i] * c;
                ody[i] = ady[i] * c;
                odz[i] = adz[i] * c;
            }
        }
        Opcode::Cos => {
            for i in 0..n {
                let s = -av[i].sin();
                odx[i] = adx[i] * s;
                ody[i] = ady[i] * s;
                odz[i] = adz[i] * s;
            }
        }
        Opcode::Tan => {
            for i in 0..n {
                let c = av[i].cos();
                let s = 1.0 / (c * c);
                odx[i] = adx[i] * s;
                ody[i] = ady[i] * s;
                odz[i] = adz[i] * s;
            }
        }
        Opcode::Asin => {
            for i in 0..n {
                let d = (1.0 - av[i] * av[i]).sqrt();
                odx[i] = adx[i] / d;
                ody[i] = ady[i] / d;
                odz[i] = adz[i] / d;
            }
        }
        Opcode::Acos => {
            for i in 0..n {
                let d = -(1.0 - av[i] * av[i]).sqrt();
                odx[i] = adx[i] / d;
                ody[i] = ady[i] / d;
                odz[i] = adz[i] / d;
            }
        }
        Opcode::Atan => {
            for i in 0..n {
                let d = av[i] * av[i] + 1.0;
                odx[i] = adx[i] / d;
                ody[i] = ady[i] / d;
                odz[i] = adz[i] / d;
            }
        }
        Opcode::Exp => {
            for i in 0..n {
                let e = av[i].exp();
                odx[i] = e * adx[i];
                ody[i] = e * ady[i];
                odz[i] = e * adz[i];
            }
        }

        Opcode::DummyA => {
            odx[..n].copy_from_slice(&adx[..n]);
            ody[..n].copy_from_slice(&ady[..n]);
            odz[..n].copy_from_slice(&adz[..n]);
        }
        Opcode::DummyB => {
            odx[..n].copy_from_slice(&bdx[..n]);
            ody[..n].copy_from_slice(&bdy[..n]);
            odz[..n].copy_from_slice(&bdz[..n]);
        }

        _ => unreachable!("not a derivative opcode: {op}"),
    }
}

/// Evaluates one clause over intervals, reporting the operand [`Choice`]
/// for `min` / `max`
pub(super) fn interval(
    op: Opcode,
    a: Interval,
    b: Interval,
) -> (Interval, Choice) {
    let out = match op {
        Opcode::Add => a + b,
        Opcode::Mul => a * b,
        Opcode::Min => return a.min_choice(b),
        Opcode::Max => return a.max_choice(b),
        Opcode::Sub => a - b,
        Opcode::Div => a / b,
        Opcode::Atan2 => a.atan2(b),
        Opcode::Pow => a.pow_const(b.lower()),
        Opcode::NthRoot => a.pow_const(1.0 / b.lower()),
        Opcode::Mod => a.mod_envelope(b),
        Opcode::NanFill => {
            if a.has_nan() {
                b
            } else {
                a
            }
        }

        Opcode::Square => a.square(),
        Opcode::Sqrt => a.sqrt(),
        Opcode::Neg => -a,
        Opcode::Abs => a.abs(),
        Opcode::Sin => a.sin(),
        Opcode::Cos => a.cos(),
        Opcode::Tan => a.tan(),
        Opcode::Asin => a.asin(),
        Opcode::Acos => a.acos(),
        Opcode::Atan => a.atan(),
        Opcode::Exp => a.exp(),

        Opcode::DummyA => a,
        Opcode::DummyB => b,

        _ => unreachable!("not an interval opcode: {op}"),
    };
    (out, Choice::Both)
}
