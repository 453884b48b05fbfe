use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use fiducial_icp::geometry::{project_point, rotation_vector_to_matrix, Mat34};
use fiducial_icp::IcpHandle;

fn camera_matrix(fx: f64, fy: f64, cx: f64, cy: f64) -> Mat34 {
    [
        [fx, 0.0, cx, 0.0],
        [0.0, fy, cy, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ]
}

fn pose_from(w: &[f64; 3], t: &[f64; 3]) -> Mat34 {
    let r = rotation_vector_to_matrix(w);
    [
        [r[0][0], r[0][1], r[0][2], t[0]],
        [r[1][0], r[1][1], r[1][2], t[1]],
        [r[2][0], r[2][1], r[2][2], t[2]],
    ]
}

fn bench_refine(c: &mut Criterion) {
    let mut group = c.benchmark_group("refine");

    let camera = camera_matrix(700.0, 700.0, 320.0, 240.0);
    let truth = pose_from(&[0.2, -0.1, 0.3], &[0.5, -0.2, 50.0]);
    let initial = pose_from(&[0.15, -0.05, 0.25], &[0.3, -0.1, 45.0]);

    for num_points in [4, 16, 64, 256].iter() {
        let world = (0..*num_points)
            .map(|_| {
                [
                    rand::random::<f64>() * 10.0 - 5.0,
                    rand::random::<f64>() * 10.0 - 5.0,
                    0.0,
                ]
            })
            .collect::<Vec<_>>();
        let image = world
            .iter()
            .map(|p| project_point(&camera, &truth, p).unwrap())
            .collect::<Vec<_>>();

        let mut handle = IcpHandle::new(camera);
        handle.set_break_loop_error_thresh(1e-10);
        handle.set_break_loop_error_thresh2(0.0);

        group.bench_with_input(
            BenchmarkId::new("refine", num_points),
            &(&world, &image),
            |b, i| {
                let (world, image) = (i.0, i.1);
                b.iter(|| {
                    let result = handle.refine(world, image, &initial).unwrap();
                    black_box(result);
                });
            },
        );
    }
}

criterion_group!(benches, bench_refine);
criterion_main!(benches);
