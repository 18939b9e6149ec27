use std::ops::Range;

use itertools::Itertools;
use ndarray::{s, Array1};

use crate::math::mirror_first;
use crate::{Error, Result};

/// A gap-free, index-aligned run of conditioned catalyst measurements
///
/// All series share one length and one time axis. Efficiency follows the one-step delay model:
/// `eta[k]` depends on the inlet concentration at `k - 1` and the outlet concentration at `k`.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    name: String,
    /// Time [s]
    t: Array1<f64>,
    /// Outlet NOx concentration
    x1: Array1<f64>,
    /// Inlet NOx concentration
    u1: Array1<f64>,
    /// Urea dosing rate
    u2: Array1<f64>,
    /// Catalyst temperature
    temperature: Array1<f64>,
    /// Exhaust mass flow
    flow: Array1<f64>,
    /// Instantaneous NOx reduction efficiency
    eta: Array1<f64>,
}

/// Raw series used to assemble a [`Segment`]
///
/// When `eta` is `None` it is derived from `x1` and `u1` with [`efficiency`].
#[derive(Clone, Debug, Default)]
pub struct SegmentData {
    pub t: Vec<f64>,
    pub x1: Vec<f64>,
    pub u1: Vec<f64>,
    pub u2: Vec<f64>,
    pub temperature: Vec<f64>,
    pub flow: Vec<f64>,
    pub eta: Option<Vec<f64>>,
}

fn check_length(name: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::LengthMismatch {
            name,
            expected,
            found,
        })
    }
}

impl Segment {
    /// Assemble a segment, checking the series are aligned and long enough to hold one
    /// delayed efficiency pair
    ///
    /// # Errors
    /// - [`Error::LengthMismatch`] if any series differs in length from `t`
    /// - [`Error::InsufficientSamples`] if the segment holds fewer than two samples
    pub fn new(name: impl Into<String>, data: SegmentData) -> Result<Self> {
        let n = data.t.len();
        if n < 2 {
            return Err(Error::InsufficientSamples {
                required: 2,
                found: n,
            });
        }
        check_length("x1", n, data.x1.len())?;
        check_length("u1", n, data.u1.len())?;
        check_length("u2", n, data.u2.len())?;
        check_length("T", n, data.temperature.len())?;
        check_length("F", n, data.flow.len())?;

        let eta = match data.eta {
            Some(eta) => {
                check_length("eta", n, eta.len())?;
                eta
            }
            None => efficiency(&data.x1, &data.u1),
        };

        Ok(Self {
            name: name.into(),
            t: Array1::from(data.t),
            x1: Array1::from(data.x1),
            u1: Array1::from(data.u1),
            u2: Array1::from(data.u2),
            temperature: Array1::from(data.temperature),
            flow: Array1::from(data.flow),
            eta: Array1::from(eta),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub const fn t(&self) -> &Array1<f64> {
        &self.t
    }

    pub const fn x1(&self) -> &Array1<f64> {
        &self.x1
    }

    pub const fn u1(&self) -> &Array1<f64> {
        &self.u1
    }

    pub const fn u2(&self) -> &Array1<f64> {
        &self.u2
    }

    pub const fn temperature(&self) -> &Array1<f64> {
        &self.temperature
    }

    pub const fn flow(&self) -> &Array1<f64> {
        &self.flow
    }

    pub const fn eta(&self) -> &Array1<f64> {
        &self.eta
    }

    /// Split the segment wherever consecutive time stamps are further apart than `max_gap`
    ///
    /// The leading efficiency of every piece is refilled from its successor so that no delay pair
    /// straddles a gap.
    /// Pieces with fewer than two samples cannot hold a delay pair and are dropped. Each piece
    /// is named `<name>_<i>` in time order.
    ///
    /// # Errors
    /// Propagates construction errors of the individual pieces.
    pub fn split_at_gaps(&self, max_gap: f64) -> Result<Vec<Self>> {
        let t = self.t.to_vec();
        gap_ranges(&t, max_gap)
            .into_iter()
            .filter(|range| range.len() >= 2)
            .enumerate()
            .map(|(ii, range)| self.piece(format!("{}_{ii}", self.name), range))
            .collect()
    }

    fn piece(&self, name: String, range: Range<usize>) -> Result<Self> {
        let take = |series: &Array1<f64>| series.slice(s![range.clone()]).to_vec();
        // The leading value paired with the sample before the gap
        let mut eta = take(&self.eta);
        mirror_first(&mut eta);
        Self::new(
            name,
            SegmentData {
                t: take(&self.t),
                x1: take(&self.x1),
                u1: take(&self.u1),
                u2: take(&self.u2),
                temperature: take(&self.temperature),
                flow: take(&self.flow),
                eta: Some(eta),
            },
        )
    }
}

/// Compute NOx reduction efficiency under the one-step delay model
///
/// $$
///     \eta[k] = u_1[k - 1] - x_1[k], \quad k \geq 1
/// $$
///
/// with `eta[0]` mirrored from `eta[1]`. Concentrations are expected to be normalised upstream so
/// that the difference is expressed in efficiency units.
pub fn efficiency(x1: &[f64], u1: &[f64]) -> Vec<f64> {
    let mut eta = Vec::with_capacity(x1.len());
    if !x1.is_empty() {
        eta.push(f64::NAN);
    }
    eta.extend(
        u1.iter()
            .zip(x1.iter().skip(1))
            .map(|(inlet, outlet)| inlet - outlet),
    );
    mirror_first(&mut eta);
    eta
}

/// Index ranges of `t` between time discontinuities larger than `max_gap`
pub fn gap_ranges(t: &[f64], max_gap: f64) -> Vec<Range<usize>> {
    let mut breaks = vec![0];
    breaks.extend(
        t.iter()
            .tuple_windows()
            .positions(|(a, b)| b - a > max_gap)
            .map(|position| position + 1),
    );
    breaks.push(t.len());
    breaks
        .into_iter()
        .tuple_windows()
        .map(|(start, end)| start..end)
        .filter(|range| !range.is_empty())
        .collect()
}
