//! Per-phase power and energy reconstruction
//!
//! Inverters report one cumulative energy counter. Per-phase energy is
//! rebuilt by distributing each increase of that counter over the phases in
//! proportion to their apparent power (V x I). The phase energies always sum
//! to the aggregate counter, so rounding never accumulates into drift.

use crate::device::{InverterPhase, PhaseMeasurement};
use crate::solar_api::{CommonInverterData, ThreePhaseData};

/// Rebuilds per-phase measurements for one inverter
#[derive(Debug, Clone)]
pub struct PhaseEnergyProcessor {
    /// Number of phases the inverter feeds (1..=3)
    phase_count: usize,

    /// Assignment of a single-phase inverter
    phase: InverterPhase,

    /// Saved per-phase energy (kWh), used to seed the first distribution
    baseline: [f64; 3],

    /// Aggregate energy (kWh) at the previous three-phase update, NaN before the first
    previous_total: f64,

    /// Distributed phase energies (kWh); survives published resets
    accumulated: [f64; 3],

    mean: PhaseMeasurement,
    phases: [PhaseMeasurement; 3],
}

impl PhaseEnergyProcessor {
    pub fn new(phase_count: u8, phase: InverterPhase, baseline: [f64; 3]) -> Self {
        Self {
            phase_count: usize::from(phase_count.clamp(1, 3)),
            phase,
            baseline,
            previous_total: f64::NAN,
            accumulated: [f64::NAN; 3],
            mean: PhaseMeasurement::default(),
            phases: [PhaseMeasurement::default(); 3],
        }
    }

    pub fn mean(&self) -> &PhaseMeasurement {
        &self.mean
    }

    pub fn phases(&self) -> &[PhaseMeasurement; 3] {
        &self.phases
    }

    pub fn phase(&self) -> InverterPhase {
        self.phase
    }

    /// Change the phase assignment. Published values of a single-phase
    /// inverter are cleared; the new phase fills on the next update.
    pub fn set_phase(&mut self, phase: InverterPhase) {
        if phase == self.phase {
            return;
        }
        self.phase = phase;
        if self.phase_count == 1 {
            self.phases.iter_mut().for_each(PhaseMeasurement::reset);
        }
    }

    /// Clear published values after a connection loss
    pub fn reset(&mut self) {
        self.mean.reset();
        self.phases.iter_mut().for_each(PhaseMeasurement::reset);
    }

    /// Per-phase energy worth persisting
    pub fn energy_baseline(&self) -> [f64; 3] {
        [0, 1, 2].map(|i| self.phases[i].energy)
    }

    /// Apply aggregate values. Energy is converted from Wh to kWh.
    pub fn process_common(&mut self, data: &CommonInverterData) {
        self.mean = PhaseMeasurement {
            current: data.ac_current,
            voltage: data.ac_voltage,
            power: data.ac_power,
            energy: data.total_energy / 1000.0,
        };
        if self.phase_count == 1
            && let Some(index) = self.phase.index()
        {
            self.phases[index] = self.mean;
        }
    }

    /// Spread a single-phase inverter over L1 and L2 (split-phase wiring)
    pub fn apply_split_phase(&mut self) {
        if self.phase_count != 1 || self.phase != InverterPhase::MultiPhase {
            return;
        }
        for p in &mut self.phases[..2] {
            p.power = self.mean.power / 2.0;
            p.energy = self.mean.energy / 2.0;
        }
    }

    /// Apply per-phase current and voltage, then distribute power and energy
    ///
    /// Must follow `process_common` for the same sample.
    pub fn process_three_phase(&mut self, data: &ThreePhaseData) {
        let n = self.phase_count;
        for i in 0..n {
            self.phases[i].current = data.ac_current[i];
            self.phases[i].voltage = data.ac_voltage[i];
        }

        let vi: Vec<f64> = (0..n)
            .map(|i| {
                let v = data.ac_voltage[i] * data.ac_current[i];
                if v.is_finite() && v > 0.0 { v } else { 0.0 }
            })
            .collect();
        let shares = normalise(&vi);

        for (i, share) in shares.iter().enumerate() {
            self.phases[i].power = self.mean.power * share;
        }

        self.distribute_energy(&shares);
    }

    fn distribute_energy(&mut self, shares: &[f64]) {
        let n = shares.len();
        let total = self.mean.energy;
        if !total.is_finite() {
            return;
        }

        let previous: Vec<f64> = self.accumulated[..n]
            .iter()
            .map(|&e| if e.is_finite() && e > 0.0 { e } else { 0.0 })
            .collect();

        let next: Vec<f64> = if !self.previous_total.is_finite() {
            let seed: Vec<f64> = self.baseline[..n]
                .iter()
                .map(|&e| if e.is_normal() && e > 0.0 { e } else { 0.0 })
                .collect();
            normalise(&seed).iter().map(|s| total * s).collect()
        } else if total < self.previous_total {
            // Counter went backwards: keep the ratio, drop the delta
            normalise(&previous).iter().map(|s| total * s).collect()
        } else {
            let delta = total - self.previous_total;
            normalise(&previous)
                .iter()
                .zip(shares)
                .map(|(ratio, share)| self.previous_total * ratio + delta * share)
                .collect()
        };

        for (i, energy) in next.into_iter().enumerate() {
            self.accumulated[i] = energy;
            self.phases[i].energy = energy;
        }
        self.previous_total = total;
    }
}

/// Weights as fractions of their sum; equal split when the sum is zero
fn normalise(weights: &[f64]) -> Vec<f64> {
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 {
        weights.iter().map(|w| w / sum).collect()
    } else {
        vec![1.0 / weights.len() as f64; weights.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(power: f64, energy_wh: f64) -> CommonInverterData {
        CommonInverterData {
            ac_power: power,
            ac_current: 10.0,
            ac_voltage: 230.0,
            total_energy: energy_wh,
            ..CommonInverterData::default()
        }
    }

    fn three_phase(current: [f64; 3]) -> ThreePhaseData {
        ThreePhaseData {
            ac_current: current,
            ac_voltage: [230.0; 3],
        }
    }

    fn phase_sum(p: &PhaseEnergyProcessor) -> f64 {
        p.phases().iter().map(|m| m.energy).sum()
    }

    fn update(p: &mut PhaseEnergyProcessor, power: f64, wh: f64, current: [f64; 3]) {
        p.process_common(&common(power, wh));
        p.process_three_phase(&three_phase(current));
    }

    #[test]
    fn single_phase_copies_to_assigned_phase() {
        let mut p = PhaseEnergyProcessor::new(1, InverterPhase::L2, [f64::NAN; 3]);
        p.process_common(&common(1200.0, 5000.0));
        assert_eq!(p.mean().energy, 5.0);
        assert_eq!(p.phases()[1].power, 1200.0);
        assert_eq!(p.phases()[1].energy, 5.0);
        assert!(p.phases()[0].power.is_nan());
    }

    #[test]
    fn phase_change_clears_single_phase_values() {
        let mut p = PhaseEnergyProcessor::new(1, InverterPhase::L1, [f64::NAN; 3]);
        p.process_common(&common(1200.0, 5000.0));
        p.set_phase(InverterPhase::L3);
        assert!(p.phases().iter().all(|m| m.power.is_nan()));
        p.process_common(&common(1000.0, 5000.0));
        assert_eq!(p.phases()[2].power, 1000.0);
    }

    #[test]
    fn split_phase_halves_power_and_energy() {
        let mut p = PhaseEnergyProcessor::new(1, InverterPhase::MultiPhase, [f64::NAN; 3]);
        p.process_common(&common(3000.0, 8000.0));
        p.apply_split_phase();
        assert_eq!(p.phases()[0].power, 1500.0);
        assert_eq!(p.phases()[1].energy, 4.0);
        assert!(p.phases()[2].power.is_nan());
    }

    #[test]
    fn power_follows_apparent_power() {
        let mut p = PhaseEnergyProcessor::new(3, InverterPhase::MultiPhase, [f64::NAN; 3]);
        update(&mut p, 4000.0, 10_000.0, [10.0, 5.0, 5.0]);
        assert!((p.phases()[0].power - 2000.0).abs() < 1e-9);
        assert!((p.phases()[1].power - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn zero_apparent_power_splits_evenly() {
        let mut p = PhaseEnergyProcessor::new(3, InverterPhase::MultiPhase, [f64::NAN; 3]);
        update(&mut p, 0.0, 9000.0, [0.0, 0.0, 0.0]);
        for m in p.phases() {
            assert_eq!(m.power, 0.0);
            assert!((m.energy - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn first_update_seeds_from_baseline() {
        let mut p = PhaseEnergyProcessor::new(3, InverterPhase::MultiPhase, [2.0, 1.0, 1.0]);
        update(&mut p, 0.0, 8000.0, [0.0; 3]);
        assert!((p.phases()[0].energy - 4.0).abs() < 1e-9);
        assert!((p.phases()[2].energy - 2.0).abs() < 1e-9);
    }

    #[test]
    fn phases_sum_to_total_across_updates() {
        let mut p = PhaseEnergyProcessor::new(3, InverterPhase::MultiPhase, [f64::NAN; 3]);
        let samples = [
            (10_000.0, [10.0, 5.0, 1.0]),
            (10_700.0, [3.0, 8.0, 2.0]),
            (11_950.5, [0.0, 0.0, 0.0]),
            (400.0, [6.0, 6.0, 6.0]), // counter reset
            (1_300.0, [1.0, 2.0, 7.0]),
        ];
        for (wh, current) in samples {
            update(&mut p, 1000.0, wh, current);
            assert!((phase_sum(&p) - p.mean().energy).abs() < 1e-9);
        }
    }

    #[test]
    fn delta_goes_to_the_producing_phase() {
        let mut p = PhaseEnergyProcessor::new(3, InverterPhase::MultiPhase, [f64::NAN; 3]);
        update(&mut p, 0.0, 3000.0, [0.0; 3]);
        update(&mut p, 1000.0, 4000.0, [10.0, 0.0, 0.0]);
        assert!((p.phases()[0].energy - 2.0).abs() < 1e-9);
        assert!((p.phases()[1].energy - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reset_keeps_distribution() {
        let mut p = PhaseEnergyProcessor::new(3, InverterPhase::MultiPhase, [f64::NAN; 3]);
        update(&mut p, 0.0, 3000.0, [0.0; 3]);
        update(&mut p, 1000.0, 4000.0, [10.0, 0.0, 0.0]);
        p.reset();
        assert!(p.mean().energy.is_nan());
        update(&mut p, 0.0, 4000.0, [0.0; 3]);
        assert!((p.phases()[0].energy - 2.0).abs() < 1e-9);
    }
}
