use std::ops::Range;

use ndarray::{s, Array1};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand_isaac::Isaac64Rng;
use serde::Serialize;
use tempdir::TempDir;

use scr_saturation::drift::{drift_statistics, select_reference};
use scr_saturation::features::{segment_features, Basis};
use scr_saturation::provider::{CsvProvider, TimeSeriesProvider};
use scr_saturation::segment::SegmentData;
use scr_saturation::{identify, identify_all, BasisConfig, Config, Segment};

const FRESH: [f64; 3] = [-0.2, 0.3, 1.0];
const AGED: [f64; 3] = [-0.2, 0.3, 0.8];
/// The fresh curve in raw temperature coordinates, rising from 0.89 at 450 K to 1.06 at 700 K
const FRESH_RAW: [f64; 3] = [-1.527e-6, 2.443e-3, 0.1];

const CENTRED: Basis = Basis::Centred {
    t0: 300.0,
    tr: 100.0,
};

fn config() -> Config {
    Config {
        eps_max: 0.05,
        basis: Some(BasisConfig {
            t0: 300.0,
            tr: 100.0,
        }),
        ..Config::default()
    }
}

/// A segment whose efficiency sits just below `theta` for roughly sixty percent of the samples
/// and well below it otherwise
fn synthetic_segment<R: Rng>(
    basis: Basis,
    temperatures: Range<f64>,
    theta: [f64; 3],
    num_samples: usize,
    rng: &mut R,
) -> SegmentData {
    let noise = Normal::<f64>::new(0.0, 0.01).unwrap();

    let mut data = SegmentData::default();
    let mut eta = vec![0.0];
    for k in 0..num_samples {
        let temperature = rng.gen_range(temperatures.clone());
        let flow = rng.gen_range(1.0..2.0);
        let ratio = rng.gen_range(0.5..1.5);
        let u1 = ratio * flow;

        data.t.push(k as f64);
        data.x1.push(0.0);
        data.u1.push(u1);
        data.u2.push(rng.gen_range(0.0..1.0));
        data.temperature.push(temperature);
        data.flow.push(flow);

        if k + 1 < num_samples {
            let phi = basis.evaluate(temperature);
            let saturated: f64 = ratio * phi.iter().zip(theta).map(|(p, c)| p * c).sum::<f64>();
            let next = if rng.gen_bool(0.6) {
                saturated - noise.sample(rng).abs()
            } else {
                saturated * rng.gen_range(0.2..0.6)
            };
            eta.push(next);
        }
    }
    eta[0] = eta[1];
    data.eta = Some(eta);
    data
}

fn segment(name: &str, theta: [f64; 3], seed: u64) -> Segment {
    let mut rng = Isaac64Rng::seed_from_u64(seed);
    Segment::new(
        name,
        synthetic_segment(CENTRED, 200.0..400.0, theta, 400, &mut rng),
    )
    .unwrap()
}

#[test]
fn envelope_bounds_every_observation() {
    let segment = segment("fresh", FRESH, 40);
    let config = config();
    let model = identify(&segment, &config).unwrap();

    let phi = segment_features(&segment, Basis::from(config.basis)).unwrap();
    let bound = phi.slice(s![..-1, ..]).dot(model.theta_lp());
    for (b, h) in bound.iter().zip(segment.eta().slice(s![1..])) {
        assert!(*b >= h - 1e-6, "envelope {b} below observation {h}");
    }
}

#[test]
fn coefficients_keep_their_signs_at_both_stages() {
    let model = identify(&segment("fresh", FRESH, 40), &config()).unwrap();
    for theta in [model.theta_lp(), model.theta()] {
        assert!(theta[0] <= 0.0);
        assert!(theta[1] >= 0.0);
        assert!(theta[2] >= 0.0);
    }
}

#[test]
fn refined_coefficients_recover_the_saturated_curve() {
    let segment = segment("fresh", FRESH, 40);
    let model = identify(&segment, &config()).unwrap();

    for (fitted, truth) in model.theta().iter().zip(FRESH) {
        approx::assert_abs_diff_eq!(*fitted, truth, epsilon = 0.05);
    }

    // Roughly sixty percent of the delay pairs are saturated
    let saturated = model.classification().len();
    assert!(saturated > 180 && saturated < 300, "{saturated} saturated samples");
    assert_eq!(model.weights().len(), saturated);

    let scale = model.fit().distribution.scale();
    assert!(scale > 1e-4 && scale < 0.05, "residual scale {scale}");
    approx::assert_relative_eq!(
        model.lambda(),
        (std::f64::consts::PI / 2.0).sqrt() / scale,
        max_relative = 1e-12
    );
}

#[test]
fn identification_is_deterministic() {
    let segment = segment("fresh", FRESH, 40);
    let first = identify(&segment, &config()).unwrap();
    let second = identify(&segment, &config()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn covariance_is_symmetric_positive_definite() {
    let model = identify(&segment("fresh", FRESH, 40), &config()).unwrap();
    let c = model.covariance();

    for ii in 0..3 {
        for jj in 0..3 {
            approx::assert_relative_eq!(c[[ii, jj]], c[[jj, ii]], max_relative = 1e-9);
        }
    }
    // Sylvester's criterion
    let minor_1 = c[[0, 0]];
    let minor_2 = c[[0, 0]] * c[[1, 1]] - c[[0, 1]] * c[[1, 0]];
    let minor_3 = c[[0, 0]] * (c[[1, 1]] * c[[2, 2]] - c[[1, 2]] * c[[2, 1]])
        - c[[0, 1]] * (c[[1, 0]] * c[[2, 2]] - c[[1, 2]] * c[[2, 0]])
        + c[[0, 2]] * (c[[1, 0]] * c[[2, 1]] - c[[1, 1]] * c[[2, 0]]);
    assert!(minor_1 > 0.0 && minor_2 > 0.0 && minor_3 > 0.0);
}

#[test]
fn predicting_the_identified_segment_reproduces_the_fit() {
    let segment = segment("fresh", FRESH, 40);
    let model = identify(&segment, &config()).unwrap();
    let prediction = model.predict_segment(&segment).unwrap();

    assert_eq!(prediction.len(), segment.len());
    for (p, f) in prediction.eta.iter().zip(model.fitted()) {
        approx::assert_relative_eq!(*p, *f, max_relative = 1e-12);
    }
    assert!(prediction.sigma.iter().all(|&s| s >= 0.0));
    assert_eq!(prediction.eta[0], prediction.eta[1]);
}

#[test]
fn models_transfer_to_other_segments() {
    let model = identify(&segment("fresh", FRESH, 40), &config()).unwrap();
    let other = segment("other", FRESH, 41);
    let prediction = model.predict_segment(&other).unwrap();

    // The prediction should bound the saturated samples of the unseen segment closely
    let eta: Array1<f64> = other.eta().to_owned();
    let within = prediction
        .eta
        .iter()
        .zip(&eta)
        .filter(|(p, e)| (*p - *e).abs() < 0.05)
        .count();
    assert!(within > 180, "only {within} samples near the prediction");
}

#[test]
fn aged_catalyst_drifts_from_the_fresh_reference() {
    let segments = vec![segment("fresh", FRESH, 40), segment("aged", AGED, 42)];
    let models = identify_all(&segments, &config())
        .into_iter()
        .collect::<scr_saturation::Result<Vec<_>>>()
        .unwrap();

    let reference = select_reference(&models).unwrap();
    assert_eq!(reference.name(), "fresh");

    let tests = drift_statistics(&models, reference).unwrap();
    assert_eq!(tests[0].statistic, 0.0);
    assert!(!tests[0].rejects(0.01));
    assert!(tests[1].rejects(0.01));
}

#[test]
fn raw_temperature_basis_identifies_realistic_segments() {
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let data = synthetic_segment(Basis::Raw, 450.0..700.0, FRESH_RAW, 400, &mut rng);
    let segment = Segment::new("raw", data).unwrap();
    let config = Config {
        eps_max: 0.05,
        ..Config::default()
    };
    assert_eq!(config.basis, None);

    let model = identify(&segment, &config).unwrap();
    for theta in [model.theta_lp(), model.theta()] {
        assert!(theta[0] <= 0.0 && theta[1] >= 0.0 && theta[2] >= 0.0);
    }
    assert!(model.covariance().iter().all(|c| c.is_finite()));
    assert!(model.covariance().diag().iter().all(|&c| c > 0.0));

    // Saturated samples are reproduced from the true curve to within the residual noise
    let classification = model.classification();
    assert!(classification.len() > 180, "{} saturated", classification.len());
    for &k in &classification.idx {
        let phi = Basis::Raw.evaluate(segment.temperature()[k]);
        let ratio = segment.u1()[k] / segment.flow()[k];
        let truth: f64 = ratio * phi.iter().zip(FRESH_RAW).map(|(p, c)| p * c).sum::<f64>();
        let fitted = model.fitted()[k + 1];
        assert!((fitted - truth).abs() < 0.03, "sample {k}: {fitted} against {truth}");
    }

    let prediction = model.predict_segment(&segment).unwrap();
    assert!(prediction.sigma.iter().all(|s| s.is_finite() && *s >= 0.0));
}

#[derive(Serialize)]
struct Row {
    t: f64,
    y1: f64,
    u1: f64,
    u2: f64,
    #[serde(rename = "T")]
    temperature: f64,
    #[serde(rename = "F")]
    flow: f64,
    eta: f64,
}

#[test]
fn identification_from_files_matches_in_memory() {
    let dir = TempDir::new("identification_from_files").unwrap();
    let segment = segment("fresh", FRESH, 40);

    let mut writer = csv::Writer::from_path(dir.path().join("fresh.csv")).unwrap();
    for k in 0..segment.len() {
        writer
            .serialize(Row {
                t: segment.t()[k],
                y1: segment.x1()[k],
                u1: segment.u1()[k],
                u2: segment.u2()[k],
                temperature: segment.temperature()[k],
                flow: segment.flow()[k],
                eta: segment.eta()[k],
            })
            .unwrap();
    }
    writer.flush().unwrap();

    let config_path = dir.path().join("identification.toml");
    std::fs::write(
        &config_path,
        "eps_max = 0.05\n\n[basis]\nt0 = 300.0\ntr = 100.0\n\n[weighting]\nkind = \"density\"\n",
    )
    .unwrap();
    let config = Config::from_file(&config_path).unwrap();
    assert_eq!(config, self::config());

    let provider = CsvProvider::new(dir.path());
    assert_eq!(provider.ids().unwrap(), vec!["fresh".to_owned()]);
    let from_file = identify(&provider.segment("fresh").unwrap(), &config).unwrap();
    let in_memory = identify(&segment, &config).unwrap();

    for (a, b) in from_file.theta().iter().zip(in_memory.theta()) {
        approx::assert_relative_eq!(*a, *b, max_relative = 1e-9);
    }
}
