// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve shaping.
//!
//! A curve maps temperature readings to PWM percentages (0-100). Each
//! configured point gives a PWM and, per sensor, the temperature at which
//! that PWM is reached; values in between are linearly interpolated.
//!
//! For every (sensor, fan) pair the configured points are completed with:
//! - an anchor at 0°C holding the first PWM (flat below the first point),
//! - an anchor at the last temperature holding 100% when the last PWM is
//!   below 100 (full speed past the last point).

use crate::config::FanSettings;
use crate::hwmon::{Temperature, TemperatureId};
use crate::openfan::FanId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CurveError {
    #[error("{0:?}: temperature not found")]
    SensorNotFound(String),
}

/// The decision for one fan at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: FanId,
    #[serde(skip, default = "Instant::now")]
    pub evaluated_at: Instant,
    pub label: String,
    /// Percent, 0-100
    pub pwm: u8,
    pub rpm: u16,
    #[serde(skip)]
    pub temperature_id: TemperatureId,
    pub temperature_name: String,
    pub temperature: f64,
}

impl Evaluation {
    /// A record for a fan that has no evaluation yet.
    pub fn idle(id: FanId, label: &str) -> Self {
        Self {
            id,
            evaluated_at: Instant::now(),
            label: label.to_string(),
            pwm: 0,
            rpm: 0,
            temperature_id: TemperatureId::default(),
            temperature_name: String::new(),
            temperature: 0.0,
        }
    }
}

/// One linear piece of a curve, valid from `temperature` upwards.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    temperature: f64,
    pwm: f64,
    slope: f64,
}

impl Segment {
    /// The line through `(t1, p1)` and `(t2, p2)`, starting at `t1`.
    fn between(t1: f64, p1: f64, t2: f64, p2: f64) -> Self {
        // A vertical step is drawn as a unit-wide one so the slope stays finite
        // and keeps its direction.
        let (x1, x2) = if t1 == t2 { (1.0, 2.0) } else { (t1, t2) };
        Self {
            temperature: t1,
            pwm: p1 - (p2 - p1) / (x2 - x1) * (x1 - t1),
            slope: (p2 - p1) / (x2 - x1),
        }
    }

    fn eval(&self, t: f64) -> f64 {
        (self.pwm + self.slope * (t - self.temperature)).min(100.0)
    }
}

/// Maps temperature readings to per-fan PWM. Built once from configuration.
#[derive(Debug, Clone)]
pub struct CurveShaper {
    labels: HashMap<FanId, String>,
    index: HashMap<TemperatureId, BTreeMap<FanId, Vec<Segment>>>,
}

impl CurveShaper {
    /// Build the segments of every fan curve. `temps` is the sensor catalog
    /// used to resolve threshold names to sensor ids.
    pub fn new(fans: &[FanSettings], temps: &[Temperature]) -> Result<Self, CurveError> {
        let find_id = |name: &str| {
            temps
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.id)
                .ok_or_else(|| CurveError::SensorNotFound(name.to_string()))
        };

        let mut shaper = Self {
            labels: HashMap::new(),
            index: HashMap::new(),
        };

        for fan in fans {
            shaper.labels.insert(fan.id, fan.label.clone());

            // (temperature, pwm) anchors per sensor, in curve order
            let mut anchors: BTreeMap<TemperatureId, Vec<(f64, f64)>> = BTreeMap::new();
            for (i, point) in fan.curve_points.iter().enumerate() {
                for (name, &threshold) in &point.thresholds {
                    let tid = find_id(name)?;
                    let points = anchors.entry(tid).or_default();
                    if i == 0 {
                        points.push((0.0, point.pwm as f64));
                    }
                    points.push((threshold as f64, point.pwm as f64));
                }
            }

            for (tid, mut points) in anchors {
                if let Some(&(t, p)) = points.last() {
                    if p < 100.0 {
                        points.push((t, 100.0));
                    }
                }

                let segments: Vec<Segment> = points
                    .windows(2)
                    .map(|w| Segment::between(w[0].0, w[0].1, w[1].0, w[1].1))
                    .collect();

                shaper.index.entry(tid).or_default().insert(fan.id, segments);
            }
        }

        Ok(shaper)
    }

    /// The PWM required for `fan` by sensor `tid` at temperature `t`, if that
    /// sensor drives that fan.
    pub fn pwm_for(&self, tid: TemperatureId, fan: FanId, t: f64) -> Option<u8> {
        let segments = self.index.get(&tid)?.get(&fan)?;
        Some(pwm_from_segments(segments, t))
    }

    /// Evaluate every reading and keep, per fan, the highest demanded PWM.
    /// On a tie the later reading wins.
    pub fn eval(&self, temps: &[Temperature]) -> BTreeMap<FanId, Evaluation> {
        let now = Instant::now();
        let mut pwms: BTreeMap<FanId, Evaluation> = BTreeMap::new();

        for t in temps {
            let Some(fans) = self.index.get(&t.id) else {
                continue;
            };
            for (&fan, segments) in fans {
                let candidate = Evaluation {
                    id: fan,
                    evaluated_at: now,
                    label: self.labels.get(&fan).cloned().unwrap_or_default(),
                    pwm: pwm_from_segments(segments, t.temperature),
                    rpm: 0,
                    temperature_id: t.id,
                    temperature_name: t.name.clone(),
                    temperature: t.temperature,
                };

                match pwms.get(&fan) {
                    Some(current) if current.pwm > candidate.pwm => {}
                    _ => {
                        pwms.insert(fan, candidate);
                    }
                }
            }
        }

        pwms
    }
}

/// Walk from the hottest segment down and use the first one that starts at
/// or below `t`. Colder than every segment means full speed.
fn pwm_from_segments(segments: &[Segment], t: f64) -> u8 {
    segments
        .iter()
        .rev()
        .find(|s| t >= s.temperature)
        .map(|s| s.eval(t).clamp(0.0, 100.0) as u8)
        .unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CurvePoint;
    use std::time::Duration;

    const CPU: &str = "k10temp: Tctl";
    const GPU: &str = "amdgpu: edge";

    fn catalog() -> Vec<Temperature> {
        vec![
            Temperature {
                id: TemperatureId(0),
                name: CPU.to_string(),
                ..Default::default()
            },
            Temperature {
                id: TemperatureId(1),
                name: GPU.to_string(),
                ..Default::default()
            },
        ]
    }

    fn reading(id: u16, name: &str, temperature: f64) -> Temperature {
        Temperature {
            id: TemperatureId(id),
            name: name.to_string(),
            temperature,
            ..Default::default()
        }
    }

    fn point(pwm: u8, thresholds: &[(&str, i32)]) -> CurvePoint {
        CurvePoint {
            pwm,
            thresholds: thresholds
                .iter()
                .map(|(n, t)| (n.to_string(), *t))
                .collect(),
        }
    }

    fn fan(index: u8, points: Vec<CurvePoint>) -> FanSettings {
        FanSettings {
            id: FanId::new(index).unwrap(),
            label: format!("label{index}"),
            step_up: Duration::ZERO,
            step_down: Duration::ZERO,
            curve_points: points,
        }
    }

    fn cpu_curve() -> FanSettings {
        fan(
            0,
            vec![
                point(20, &[(CPU, 40)]),
                point(50, &[(CPU, 60)]),
                point(80, &[(CPU, 75)]),
            ],
        )
    }

    fn eval_one(shaper: &CurveShaper, id: u16, name: &str, t: f64) -> u8 {
        shaper.eval(&[reading(id, name, t)])[&FanId::new(0).unwrap()].pwm
    }

    #[test]
    fn test_flat_below_first_point() {
        let shaper = CurveShaper::new(&[cpu_curve()], &catalog()).unwrap();
        assert_eq!(eval_one(&shaper, 0, CPU, 0.0), 20);
        assert_eq!(eval_one(&shaper, 0, CPU, 25.0), 20);
    }

    #[test]
    fn test_exact_anchors() {
        let shaper = CurveShaper::new(&[cpu_curve()], &catalog()).unwrap();
        assert_eq!(eval_one(&shaper, 0, CPU, 40.0), 20);
        assert_eq!(eval_one(&shaper, 0, CPU, 60.0), 50);
    }

    #[test]
    fn test_interpolation() {
        let shaper = CurveShaper::new(&[cpu_curve()], &catalog()).unwrap();
        assert_eq!(eval_one(&shaper, 0, CPU, 50.0), 35);
        assert_eq!(eval_one(&shaper, 0, CPU, 70.0), 70);
    }

    #[test]
    fn test_saturates_past_last_point() {
        let shaper = CurveShaper::new(&[cpu_curve()], &catalog()).unwrap();
        assert_eq!(eval_one(&shaper, 0, CPU, 74.9), 79);
        assert_eq!(eval_one(&shaper, 0, CPU, 76.0), 100);
        assert_eq!(eval_one(&shaper, 0, CPU, 120.0), 100);
    }

    #[test]
    fn test_last_point_at_full_speed_is_exact() {
        let curve = fan(0, vec![point(30, &[(CPU, 40)]), point(100, &[(CPU, 80)])]);
        let shaper = CurveShaper::new(&[curve], &catalog()).unwrap();
        assert_eq!(eval_one(&shaper, 0, CPU, 80.0), 100);
        assert_eq!(eval_one(&shaper, 0, CPU, 60.0), 65);
        assert_eq!(eval_one(&shaper, 0, CPU, 95.0), 100);
    }

    #[test]
    fn test_colder_than_every_point_is_full_speed() {
        let shaper = CurveShaper::new(&[cpu_curve()], &catalog()).unwrap();
        assert_eq!(eval_one(&shaper, 0, CPU, -5.0), 100);
    }

    #[test]
    fn test_sensor_introduced_late_has_no_zero_anchor() {
        let curve = fan(
            0,
            vec![point(20, &[(CPU, 40)]), point(60, &[(CPU, 70), (GPU, 65)])],
        );
        let shaper = CurveShaper::new(&[curve], &catalog()).unwrap();
        // Below the GPU's only threshold there is no segment: fail safe.
        assert_eq!(
            shaper.pwm_for(TemperatureId(1), FanId::new(0).unwrap(), 50.0),
            Some(100)
        );
    }

    #[test]
    fn test_vertical_step() {
        let curve = fan(0, vec![point(30, &[(CPU, 50)]), point(70, &[(CPU, 50)])]);
        let shaper = CurveShaper::new(&[curve], &catalog()).unwrap();
        assert_eq!(eval_one(&shaper, 0, CPU, 49.0), 30);
        assert_eq!(eval_one(&shaper, 0, CPU, 50.0), 100);
    }

    #[test]
    fn test_monotonic_in_temperature() {
        let curves = [
            cpu_curve(),
            fan(
                0,
                vec![
                    point(0, &[(CPU, 30)]),
                    point(0, &[(CPU, 45)]),
                    point(35, &[(CPU, 45)]),
                    point(60, &[(CPU, 62)]),
                    point(100, &[(CPU, 85)]),
                ],
            ),
            fan(0, vec![point(45, &[(CPU, 0)]), point(55, &[(CPU, 33)])]),
        ];

        for curve in curves {
            let shaper = CurveShaper::new(&[curve], &catalog()).unwrap();
            let mut prev = 0;
            for step in 0..=1200 {
                let t = step as f64 / 10.0;
                let pwm = eval_one(&shaper, 0, CPU, t);
                assert!(pwm >= prev, "pwm decreased at {t}°C: {prev} -> {pwm}");
                assert!(pwm <= 100);
                prev = pwm;
            }
        }
    }

    #[test]
    fn test_hottest_sensor_wins() {
        let curve = fan(
            0,
            vec![
                point(20, &[(CPU, 40), (GPU, 50)]),
                point(80, &[(CPU, 80), (GPU, 70)]),
            ],
        );
        let shaper = CurveShaper::new(&[curve], &catalog()).unwrap();

        let evals = shaper.eval(&[reading(0, CPU, 60.0), reading(1, GPU, 65.0)]);
        let eval = &evals[&FanId::new(0).unwrap()];
        // CPU: 20 + 1.5 * 20 = 50, GPU: 20 + 3 * 15 = 65
        assert_eq!(eval.pwm, 65);
        assert_eq!(eval.temperature_id, TemperatureId(1));
        assert_eq!(eval.temperature_name, GPU);
        assert_eq!(eval.temperature, 65.0);
        assert_eq!(eval.label, "label0");

        let evals = shaper.eval(&[reading(0, CPU, 78.0), reading(1, GPU, 51.0)]);
        let eval = &evals[&FanId::new(0).unwrap()];
        assert_eq!(eval.pwm, 77);
        assert_eq!(eval.temperature_name, CPU);
    }

    #[test]
    fn test_tie_goes_to_later_reading() {
        let curve = fan(
            0,
            vec![
                point(20, &[(CPU, 40), (GPU, 40)]),
                point(80, &[(CPU, 80), (GPU, 80)]),
            ],
        );
        let shaper = CurveShaper::new(&[curve], &catalog()).unwrap();
        let id = FanId::new(0).unwrap();

        let evals = shaper.eval(&[reading(0, CPU, 60.0), reading(1, GPU, 60.0)]);
        assert_eq!(evals[&id].pwm, 50);
        assert_eq!(evals[&id].temperature_name, GPU);

        let evals = shaper.eval(&[reading(1, GPU, 60.0), reading(0, CPU, 60.0)]);
        assert_eq!(evals[&id].pwm, 50);
        assert_eq!(evals[&id].temperature_name, CPU);
    }

    #[test]
    fn test_unreferenced_sensor_and_fans() {
        let shaper = CurveShaper::new(
            &[cpu_curve(), fan(4, vec![point(40, &[(GPU, 50)])])],
            &catalog(),
        )
        .unwrap();

        let evals = shaper.eval(&[reading(0, CPU, 50.0)]);
        assert_eq!(evals.len(), 1);
        assert!(evals.contains_key(&FanId::new(0).unwrap()));

        let evals = shaper.eval(&[reading(0, CPU, 50.0), reading(1, GPU, 50.0)]);
        assert_eq!(evals.len(), 2);
        assert_eq!(evals[&FanId::new(4).unwrap()].pwm, 100);
        assert!(shaper.eval(&[reading(7, "other", 50.0)]).is_empty());
    }

    #[test]
    fn test_unknown_sensor_fails() {
        let curve = fan(0, vec![point(20, &[("missing", 40)])]);
        assert!(matches!(
            CurveShaper::new(&[curve], &catalog()),
            Err(CurveError::SensorNotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_evaluation_json_fields() {
        let shaper = CurveShaper::new(&[cpu_curve()], &catalog()).unwrap();
        let evals = shaper.eval(&[reading(0, CPU, 60.0)]);
        let json = serde_json::to_value(&evals[&FanId::new(0).unwrap()]).unwrap();

        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["id", "label", "pwm", "rpm", "temperature", "temperature_name"]
        );
        assert_eq!(json["id"], 0);
        assert_eq!(json["pwm"], 50);
    }
}
