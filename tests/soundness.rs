//! End-to-end properties of the cache + evaluator pipeline
use isofield::{Cache, Evaluator, Interval, Tree};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `sqrt(x² + y² + z²) - 1`
fn sphere(cache: &mut Cache) -> Tree {
    let [x, y, z] = cache.axes();
    let x2 = cache.square(x).unwrap();
    let y2 = cache.square(y).unwrap();
    let z2 = cache.square(z).unwrap();
    let s = cache.add(x2, y2).unwrap();
    let s = cache.add(s, z2).unwrap();
    let r = cache.sqrt(s).unwrap();
    let d = cache.sub(r, 1.0).unwrap();
    Tree::new(cache, d).unwrap()
}

/// A union of eight unit spheres at the cube corners, a classic pruning
/// workload: most of the `min` tree is irrelevant in any one octant
fn sphere_grid(cache: &mut Cache) -> Tree {
    let [x, y, z] = cache.axes();
    let mut root = None;
    for cx in [-2.0, 2.0] {
        for cy in [-2.0f32, 2.0] {
            for cz in [-2.0f32, 2.0] {
                let dx = cache.sub(x, cx).unwrap();
                let dy = cache.sub(y, cy).unwrap();
                let dz = cache.sub(z, cz).unwrap();
                let dx2 = cache.square(dx).unwrap();
                let dy2 = cache.square(dy).unwrap();
                let dz2 = cache.square(dz).unwrap();
                let s = cache.add(dx2, dy2).unwrap();
                let s = cache.add(s, dz2).unwrap();
                let r = cache.sqrt(s).unwrap();
                let d = cache.sub(r, 1.0).unwrap();
                root = Some(match root {
                    None => d,
                    Some(prev) => cache.min(prev, d).unwrap(),
                });
            }
        }
    }
    Tree::new(cache, root.unwrap()).unwrap()
}

/// A mixed shape exercising every sound interval envelope
fn mixed(cache: &mut Cache) -> Tree {
    let [x, y, z] = cache.axes();
    let sx = cache.sin(x).unwrap();
    let cy = cache.cos(y).unwrap();
    let p = cache.mul(sx, cy).unwrap();
    let y2 = cache.square(y).unwrap();
    let den = cache.add(y2, 1.0).unwrap();
    let q = cache.div(z, den).unwrap();
    let s = cache.add(p, q).unwrap();
    let a = cache.abs(s).unwrap();
    let e = cache.exp(x).unwrap();
    let at = cache.atan(e).unwrap();
    let m = cache.max(a, at).unwrap();
    let n = cache.neg(y).unwrap();
    let root = cache.min(m, n).unwrap();
    Tree::new(cache, root).unwrap()
}

fn random_interval(rng: &mut StdRng, lo: f32, hi: f32) -> Interval {
    let a = rng.gen_range(lo..hi);
    let b = rng.gen_range(lo..hi);
    Interval::new(a.min(b), a.max(b))
}

fn sample(rng: &mut StdRng, i: Interval) -> f32 {
    let t: f32 = rng.gen_range(0.0..1.0);
    i.lower() * (1.0 - t) + i.upper() * t
}

/// For every box and every point inside it, the point evaluation must
/// land inside the interval evaluation (give or take float rounding)
#[test]
fn interval_soundness() {
    let shapes: Vec<fn(&mut Cache) -> Tree> = vec![sphere, sphere_grid, mixed];
    let mut rng = StdRng::seed_from_u64(0x150f1e1d);
    for build in shapes {
        let mut cache = Cache::new();
        let tree = build(&mut cache);
        let mut eval = Evaluator::new(&mut cache, tree).unwrap();

        for _ in 0..64 {
            let ix = random_interval(&mut rng, -8.0, 8.0);
            let iy = random_interval(&mut rng, -8.0, 8.0);
            let iz = random_interval(&mut rng, -8.0, 8.0);
            let out = eval.eval_interval(ix, iy, iz);
            if out.has_nan() {
                continue;
            }
            let slack = 1e-3 * out.upper().abs().max(out.lower().abs()).max(1.0);
            for _ in 0..16 {
                let x = sample(&mut rng, ix);
                let y = sample(&mut rng, iy);
                let z = sample(&mut rng, iz);
                let v = eval.eval_point(x, y, z);
                if v.is_nan() {
                    continue;
                }
                assert!(
                    v >= out.lower() - slack && v <= out.upper() + slack,
                    "{v} at ({x}, {y}, {z}) outside {out}"
                );
            }
        }
    }
}

/// The compiled tape must agree with a direct structural walk of the DAG
#[test]
fn evaluator_matches_structural_walk() {
    let mut cache = Cache::new();
    let tree = mixed(&mut cache);
    let root = tree.root();
    let mut eval = Evaluator::new(&mut cache, tree).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..256 {
        let x = rng.gen_range(-4.0f32..4.0);
        let y = rng.gen_range(-4.0f32..4.0);
        let z = rng.gen_range(-4.0f32..4.0);
        let got = eval.eval_point(x, y, z);
        let expect = cache.eval_xyz(root, x, y, z).unwrap();
        assert_eq!(
            got.to_bits(),
            expect.to_bits(),
            "mismatch at ({x}, {y}, {z}): {got} != {expect}"
        );
    }
}

/// After a push, evaluation inside the pushed region must be bit-identical
/// to an unpruned evaluator
#[test]
fn pruning_preserves_values() {
    let mut cache = Cache::new();
    let tree = sphere_grid(&mut cache);
    let mut pruned = Evaluator::new(&mut cache, tree).unwrap();
    let mut plain = Evaluator::new(&mut cache, tree).unwrap();

    // One octant: only the sphere at (2, 2, 2) matters here
    let region = Interval::new(1.0, 3.0);
    pruned.eval_interval(region, region, region);
    pruned.push();
    assert!(pruned.utilization() < 1.0);

    let n = 64;
    let mut k = 0;
    for i in 0..4 {
        for j in 0..4 {
            for l in 0..4 {
                let p = |t: i32| 1.0 + 2.0 * (t as f32) / 3.0;
                pruned.set_point(p(i), p(j), p(l), k);
                plain.set_point(p(i), p(j), p(l), k);
                k += 1;
            }
        }
    }
    pruned.apply_transform(n);
    plain.apply_transform(n);
    let a = pruned.values_batch(n, false).to_vec();
    let b = plain.values_batch(n, false).to_vec();
    for i in 0..n {
        assert_eq!(a[i].to_bits(), b[i].to_bits(), "point {i} diverged");
    }

    pruned.pop().unwrap();
    assert_eq!(pruned.utilization(), 1.0);
}

/// Recursive subdivision with nested push/pop, checked against an
/// unpruned evaluator at every leaf box
#[test]
fn nested_subdivision() {
    let mut cache = Cache::new();
    let tree = sphere_grid(&mut cache);
    let mut pruned = Evaluator::new(&mut cache, tree).unwrap();
    let mut plain = Evaluator::new(&mut cache, tree).unwrap();

    fn recurse(
        pruned: &mut Evaluator,
        plain: &mut Evaluator,
        x: Interval,
        y: Interval,
        z: Interval,
        depth: usize,
    ) {
        pruned.eval_interval(x, y, z);
        pruned.push();
        if depth == 0 {
            let (cx, cy, cz) = (x.midpoint(), y.midpoint(), z.midpoint());
            let got = pruned.eval_point(cx, cy, cz);
            let expect = plain.eval_point(cx, cy, cz);
            assert_eq!(got.to_bits(), expect.to_bits());
        } else {
            let (x0, x1) = x.split();
            let (y0, y1) = y.split();
            let (z0, z1) = z.split();
            for x in [x0, x1] {
                for y in [y0, y1] {
                    for z in [z0, z1] {
                        recurse(pruned, plain, x, y, z, depth - 1);
                    }
                }
            }
        }
        pruned.pop().unwrap();
    }

    let whole = Interval::new(-4.0, 4.0);
    recurse(&mut pruned, &mut plain, whole, whole, whole, 2);
    assert_eq!(pruned.utilization(), 1.0);
}

/// Parallel rendering builds one evaluator per worker thread
#[test]
fn one_evaluator_per_thread() {
    let mut cache = Cache::new();
    let tree = sphere_grid(&mut cache);

    let mut workers = vec![];
    for worker in 0..4 {
        let mut eval = Evaluator::new(&mut cache, tree).unwrap();
        workers.push(std::thread::spawn(move || {
            // Each worker takes a horizontal slab of the sampling grid
            let mut out = vec![];
            for i in 0..16 {
                let x = (worker as f32) - 2.0;
                let y = (i as f32) / 2.0 - 4.0;
                out.push(eval.eval_point(x, y, 0.0));
            }
            out
        }));
    }
    let results: Vec<Vec<f32>> =
        workers.into_iter().map(|h| h.join().unwrap()).collect();

    // Spot-check against a fresh evaluator on this thread
    let mut eval = Evaluator::new(&mut cache, tree).unwrap();
    for (worker, row) in results.iter().enumerate() {
        for (i, v) in row.iter().enumerate() {
            let x = (worker as f32) - 2.0;
            let y = (i as f32) / 2.0 - 4.0;
            assert_eq!(*v, eval.eval_point(x, y, 0.0));
        }
    }
}
