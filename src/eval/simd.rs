//! 8-lane AVX kernels for the batch evaluators
//!
//! Operations without an AVX equivalent (transcendentals, `pow`, `mod`,
//! `nan-fill`) fall back to the scalar kernels, widened to the full
//! `⌈n/8⌉·8` element count so that whole chunks stay consistent.
//!
//! Callers pass `count` in 8-lane *chunks*, not elements.
use std::arch::x86_64::*;

use super::clause::Scratch;
use super::kernels;
use crate::opcode::Opcode;

/// Evaluates `count` 8-lane chunks of values for a single clause
///
/// # Safety
/// The caller must have confirmed AVX support (the evaluator checks once
/// at construction).
#[target_feature(enable = "avx")]
pub(super) unsafe fn values(
    op: Opcode,
    a: &Scratch,
    b: &Scratch,
    out: &mut Scratch,
    count: usize,
) {
    let av = a.f.as_ptr();
    let bv = b.f.as_ptr();
    let o = out.f.as_mut_ptr();

    macro_rules! lanes {
        (|$x:ident, $y:ident| $e:expr) => {
            for i in 0..count {
                let $x = _mm256_loadu_ps(av.add(i * 8));
                let $y = _mm256_loadu_ps(bv.add(i * 8));
                _mm256_storeu_ps(o.add(i * 8), $e);
            }
        };
        (|$x:ident| $e:expr) => {
            for i in 0..count {
                let $x = _mm256_loadu_ps(av.add(i * 8));
                _mm256_storeu_ps(o.add(i * 8), $e);
            }
        };
    }

    match op {
        Opcode::Add => lanes!(|x, y| _mm256_add_ps(x, y)),
        Opcode::Mul => lanes!(|x, y| _mm256_mul_ps(x, y)),
        Opcode::Min => lanes!(|x, y| _mm256_min_ps(x, y)),
        Opcode::Max => lanes!(|x, y| _mm256_max_ps(x, y)),
        Opcode::Sub => lanes!(|x, y| _mm256_sub_ps(x, y)),
        Opcode::Div => lanes!(|x, y| _mm256_div_ps(x, y)),

        Opcode::Square => lanes!(|x| _mm256_mul_ps(x, x)),
        Opcode::Sqrt => lanes!(|x| _mm256_sqrt_ps(x)),
        Opcode::Neg => lanes!(|x| _mm256_sub_ps(_mm256_setzero_ps(), x)),
        Opcode::Abs => {
            lanes!(|x| _mm256_andnot_ps(_mm256_set1_ps(-0.0), x))
        }

        Opcode::DummyA => lanes!(|x| x),
        Opcode::DummyB => lanes!(|_x, y| y),

        // No AVX equivalent; run the scalar kernel over whole chunks
        Opcode::Atan2
        | Opcode::Pow
        | Opcode::NthRoot
        | Opcode::Mod
        | Opcode::NanFill
        | Opcode::Sin
        | Opcode::Cos
        | Opcode::Tan
        | Opcode::Asin
        | Opcode::Acos
        | Opcode::Atan
        | Opcode::Exp => kernels::values(op, a, b, out, count * 8),

        _ => unreachable!("not a value opcode: {op}"),
    }
}

/// Evaluates `count` 8-lane chunks of values and gradients
///
/// # Safety
/// The caller must have confirmed AVX support.
#[target_feature(enable = "avx")]
pub(super) unsafe fn derivs(
    op: Opcode,
    a: &Scratch,
    b: &Scratch,
    out: &mut Scratch,
    count: usize,
) {
    // Transcendental fallback takes both values and gradients in one go
    if matches!(
        op,
        Opcode::Atan2
            | Opcode::Pow
            | Opcode::NthRoot
            | Opcode::Mod
            | Opcode::NanFill
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Tan
            | Opcode::Asin
            | Opcode::Acos
            | Opcode::Atan
            | Opcode::Exp
    ) {
        kernels::derivs(op, a, b, out, count * 8);
        return;
    }

    // Evaluate the base operation in a single pass first
    values(op, a, b, out, count);

    let av = a.f.as_ptr();
    let bv = b.f.as_ptr();
    let ov = out.f.as_ptr();
    let dxyz: [(*const f32, *const f32, *mut f32); 3] = [
        (a.dx.as_ptr(), b.dx.as_ptr(), out.dx.as_mut_ptr()),
        (a.dy.as_ptr(), b.dy.as_ptr(), out.dy.as_mut_ptr()),
        (a.dz.as_ptr(), b.dz.as_ptr(), out.dz.as_mut_ptr()),
    ];

    match op {
        Opcode::Add => {
            for (ad, bd, od) in dxyz {
                for i in 0..count {
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let v = _mm256_loadu_ps(bd.add(i * 8));
                    _mm256_storeu_ps(od.add(i * 8), _mm256_add_ps(u, v));
                }
            }
        }
        Opcode::Sub => {
            for (ad, bd, od) in dxyz {
                for i in 0..count {
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let v = _mm256_loadu_ps(bd.add(i * 8));
                    _mm256_storeu_ps(od.add(i * 8), _mm256_sub_ps(u, v));
                }
            }
        }
        Opcode::Mul => {
            // Product rule
            for (ad, bd, od) in dxyz {
                for i in 0..count {
                    let x = _mm256_loadu_ps(av.add(i * 8));
                    let y = _mm256_loadu_ps(bv.add(i * 8));
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let v = _mm256_loadu_ps(bd.add(i * 8));
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_add_ps(
                            _mm256_mul_ps(x, v),
                            _mm256_mul_ps(u, y),
                        ),
                    );
                }
            }
        }
        Opcode::Div => {
            // Quotient rule
            for (ad, bd, od) in dxyz {
                for i in 0..count {
                    let x = _mm256_loadu_ps(av.add(i * 8));
                    let y = _mm256_loadu_ps(bv.add(i * 8));
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let v = _mm256_loadu_ps(bd.add(i * 8));
                    let p = _mm256_mul_ps(y, y);
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_div_ps(
                            _mm256_sub_ps(
                                _mm256_mul_ps(y, u),
                                _mm256_mul_ps(x, v),
                            ),
                            p,
                        ),
                    );
                }
            }
        }
        Opcode::Min => {
            // Gradient of the winning branch; ties go to b
            for (ad, bd, od) in dxyz {
                for i in 0..count {
                    let x = _mm256_loadu_ps(av.add(i * 8));
                    let y = _mm256_loadu_ps(bv.add(i * 8));
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let v = _mm256_loadu_ps(bd.add(i * 8));
                    let cmp = _mm256_cmp_ps::<_CMP_LT_OQ>(x, y);
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_blendv_ps(v, u, cmp),
                    );
                }
            }
        }
        Opcode::Max => {
            for (ad, bd, od) in dxyz {
                for i in 0..count {
                    let x = _mm256_loadu_ps(av.add(i * 8));
                    let y = _mm256_loadu_ps(bv.add(i * 8));
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let v = _mm256_loadu_ps(bd.add(i * 8));
                    let cmp = _mm256_cmp_ps::<_CMP_GT_OQ>(x, y);
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_blendv_ps(v, u, cmp),
                    );
                }
            }
        }
        Opcode::Square => {
            for (ad, _bd, od) in dxyz {
                for i in 0..count {
                    let x = _mm256_loadu_ps(av.add(i * 8));
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_mul_ps(
                            _mm256_set1_ps(2.0),
                            _mm256_mul_ps(x, u),
                        ),
                    );
                }
            }
        }
        Opcode::Sqrt => {
            // Clamped to zero at non-positive inputs
            for (ad, _bd, od) in dxyz {
                for i in 0..count {
                    let x = _mm256_loadu_ps(av.add(i * 8));
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let r = _mm256_loadu_ps(ov.add(i * 8));
                    let den = _mm256_mul_ps(r, _mm256_set1_ps(2.0));
                    let cmp =
                        _mm256_cmp_ps::<_CMP_LE_OQ>(x, _mm256_setzero_ps());
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_blendv_ps(
                            _mm256_div_ps(u, den),
                            _mm256_setzero_ps(),
                            cmp,
                        ),
                    );
                }
            }
        }
        Opcode::Neg => {
            for (ad, _bd, od) in dxyz {
                for i in 0..count {
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_sub_ps(_mm256_setzero_ps(), u),
                    );
                }
            }
        }
        Opcode::Abs => {
            // Negate the gradient where the value is negative
            for (ad, _bd, od) in dxyz {
                for i in 0..count {
                    let x = _mm256_loadu_ps(av.add(i * 8));
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    let cmp =
                        _mm256_cmp_ps::<_CMP_LT_OQ>(x, _mm256_setzero_ps());
                    _mm256_storeu_ps(
                        od.add(i * 8),
                        _mm256_blendv_ps(
                            u,
                            _mm256_sub_ps(_mm256_setzero_ps(), u),
                            cmp,
                        ),
                    );
                }
            }
        }
        Opcode::DummyA => {
            for (ad, _bd, od) in dxyz {
                for i in 0..count {
                    let u = _mm256_loadu_ps(ad.add(i * 8));
                    _mm256_storeu_ps(od.add(i * 8), u);
                }
            }
        }
        Opcode::DummyB => {
            for (_ad, bd, od) in dxyz {
                for i in 0..count {
                    let v = _mm256_loadu_ps(bd.add(i * 8));
                    _mm256_storeu_ps(od.add(i * 8), v);
                }
            }
        }

        _ => unreachable!("not a derivative opcode: {op}"),
    }
}
