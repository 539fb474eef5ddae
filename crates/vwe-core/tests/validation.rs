//! Transform determinism and validation sensitivity.

use vwe_core::{
    transform, CheckStatus, GridSpec, ProbeValue, ReferenceDistribution, SampleGrid,
    SamplingStrategy, UniformSampler, ValidationConfig,
};

/// 100×100 grid whose column bands reproduce the given percentages.
fn banded(bands: &[(u32, usize)]) -> SampleGrid {
    let mut columns = Vec::new();
    for (id, width) in bands {
        columns.extend(std::iter::repeat(*id).take(*width));
    }
    assert_eq!(columns.len(), 100);
    let spec = GridSpec::new(10_000.0, 100).unwrap();
    let step = spec.step();
    UniformSampler
        .sample(&spec, &move |x: f64, _z: f64| {
            let col = (((x + 10_000.0) / step).floor() as usize).min(99);
            ProbeValue {
                biome_id: columns[col],
                height: col as f32,
            }
        })
        .unwrap()
        .grid
}

fn reference_bands() -> Vec<(u32, usize)> {
    // Ocean, DeepNorth, Meadows, BlackForest, Plains, Mountain, Swamp, Mistlands, Ashlands
    vec![
        (32, 30),
        (256, 15),
        (1, 12),
        (8, 10),
        (16, 10),
        (4, 8),
        (2, 7),
        (64, 5),
        (512, 3),
    ]
}

#[test]
fn transform_is_byte_identical_across_runs() {
    let grid = banded(&reference_bands());
    let reference = ReferenceDistribution::default();
    let config = ValidationConfig::default();

    let (raster_a, report_a) = transform(&grid, &reference, &config);
    let (raster_b, report_b) = transform(&grid, &reference, &config);
    assert_eq!(
        serde_json::to_vec(&raster_a).unwrap(),
        serde_json::to_vec(&raster_b).unwrap()
    );
    assert_eq!(
        serde_json::to_vec(&report_a).unwrap(),
        serde_json::to_vec(&report_b).unwrap()
    );
}

#[test]
fn matching_reference_passes_with_zero_aggregate() {
    let grid = banded(&reference_bands());
    let (_, report) = transform(
        &grid,
        &ReferenceDistribution::default(),
        &ValidationConfig::default(),
    );
    assert_eq!(report.aggregate_error, 0.0);
    assert_eq!(report.status, CheckStatus::Passed);
    assert!(report.checks.iter().all(|c| c.status == CheckStatus::Passed));
}

#[test]
fn twenty_point_shift_fails_only_that_category() {
    // Ocean +20 pp taken from DeepNorth (15) and Meadows (5 of 12).
    let bands = vec![
        (32, 50),
        (1, 7),
        (8, 10),
        (16, 10),
        (4, 8),
        (2, 7),
        (64, 5),
        (512, 3),
    ];
    let (_, report) = transform(
        &banded(&bands),
        &ReferenceDistribution::default(),
        &ValidationConfig::default(),
    );

    let ocean = report.check("Ocean").unwrap();
    assert_eq!(ocean.status, CheckStatus::Failed);
    assert_eq!(ocean.delta, 20.0);
    for name in ["BlackForest", "Plains", "Mountain", "Swamp", "Mistlands", "Ashlands"] {
        assert_eq!(report.check(name).unwrap().status, CheckStatus::Passed, "{name}");
    }
    assert_eq!(report.status, CheckStatus::Failed);
    assert_eq!(report.aggregate_error, 40.0);
}
