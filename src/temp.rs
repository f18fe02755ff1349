//! Array temperature control.
//!
//! The utility board reports the detector temperature as a digital number
//! from a silicon-diode sensor. Converting between digital numbers, sensor
//! voltage and temperature uses a linear ADU scale plus a piecewise
//! Chebyshev polynomial fit of the DT-670 standard curve, split over four
//! voltage ranges covering 2 K to 475 K. SmallCam systems use a simple
//! linear DT-670 approximation instead.
//!
//! The calibration constants live in [`TempParams`]. Site overrides can be
//! loaded from a bracket-keyed text file and written back out; the built-in
//! defaults are never permanently overwritten.
//!
//! Device-facing operations (reading the ADU, setting the regulation target)
//! live on [`crate::controller::Controller`]; this module is pure math and
//! persistence.

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use crate::error::{AppResult, CamError};

/// Celsius to Kelvin.
pub fn c2k(c: f64) -> f64 {
    c + 273.15
}

/// Kelvin to Celsius.
pub fn k2c(k: f64) -> f64 {
    k - 273.15
}

/// Fahrenheit to Kelvin.
pub fn f2k(f: f64) -> f64 {
    f * (9.0 / 5.0) - 459.67
}

/// Kelvin to Fahrenheit.
pub fn k2f(k: f64) -> f64 {
    (k + 459.67) * (5.0 / 9.0)
}

/// Default number of temperature reads to average.
pub const SD_NUM_OF_READS: u32 = 30;
/// Default number of bisection trials when inverting the sensor curve.
pub const SD_VOLT_TOLERANCE_TRIALS: u32 = 30;
/// Default bisection stop tolerance.
pub const SD_VOLT_TOLERANCE: f64 = 0.005;
/// Default tolerance around the mean for a read to count.
pub const SD_DEG_TOLERANCE: f64 = 3.0;

/// Default DT-670 linear coefficient 1 (SmallCam).
pub const DT670_COEFF_1: f64 = 0.03;
/// Default DT-670 linear coefficient 2 (SmallCam).
pub const DT670_COEFF_2: f64 = 0.0000251;

/// Default silicon-diode ADU offset (CY7 sensor).
pub const SD_ADU_OFFSET: f64 = 2045.0;
/// Default silicon-diode ADU per volt (CY7 sensor).
pub const SD_ADU_PER_VOLT: f64 = 1366.98;

/// Default high-gain utility board ADU offset.
pub const HG_ADU_OFFSET: f64 = -3108.0;
/// Default high-gain utility board ADU per volt.
pub const HG_ADU_PER_VOLT: f64 = 7321.0;

const DT670_COEFF_1_KEY: &str = "[TMPCTRL_DT670_COEFF_1]";
const DT670_COEFF_2_KEY: &str = "[TMPCTRL_DT670_COEFF_2]";
const SD_ADU_OFFSET_KEY: &str = "[TMPCTRL_SDADU_OFFSET]";
const SD_ADU_PER_VOLT_KEY: &str = "[TMPCTRL_SDADU_PER_VOLT]";
const HG_ADU_OFFSET_KEY: &str = "[TMPCTRL_HGADU_OFFSET]";
const HG_ADU_PER_VOLT_KEY: &str = "[TMPCTRL_HGADU_PER_VOLT]";
const SD_NUMBER_OF_READS_KEY: &str = "[TMPCTRL_SDNUMBER_OF_READS]";
const SD_VOLT_TOLERANCE_TRIALS_KEY: &str = "[TMPCTRL_SDVOLT_TOLERANCE_TRIALS]";
const SD_VOLT_TOLERANCE_KEY: &str = "[TMPCTRL_SDVOLT_TOLERANCE]";
const SD_DEG_TOLERANCE_KEY: &str = "[TMPCTRL_SDDEG_TOLERANCE]";
const SD_2_12K_COEFF_KEY: &str = "[TMPCTRL_SD2_12K_COEFF]";
const SD_12_24K_COEFF_KEY: &str = "[TMPCTRL_SD12_24K_COEFF]";
const SD_24_100K_COEFF_KEY: &str = "[TMPCTRL_SD24_100K_COEFF]";
const SD_100_475K_COEFF_KEY: &str = "[TMPCTRL_SD100_475K_COEFF]";

/// One Chebyshev fit range of the sensor curve.
#[derive(Debug, Clone, PartialEq)]
pub struct CoeffRange {
    /// Upper voltage bound (inclusive).
    pub vu: f64,
    /// Lower voltage bound (inclusive).
    pub vl: f64,
    /// Chebyshev coefficients.
    pub coeff: Vec<f64>,
}

impl CoeffRange {
    fn contains(&self, voltage: f64) -> bool {
        voltage >= self.vl && voltage <= self.vu
    }
}

/// Temperature calibration constants.
#[derive(Debug, Clone, PartialEq)]
pub struct TempParams {
    /// DT-670 linear coefficient 1 (SmallCam).
    pub dt670_coeff_1: f64,
    /// DT-670 linear coefficient 2 (SmallCam).
    pub dt670_coeff_2: f64,
    /// Silicon-diode ADU offset.
    pub sd_adu_offset: f64,
    /// Silicon-diode ADU per volt.
    pub sd_adu_per_volt: f64,
    /// High-gain utility board ADU offset.
    pub hg_adu_offset: f64,
    /// High-gain utility board ADU per volt.
    pub hg_adu_per_volt: f64,
    /// Number of reads averaged per temperature query.
    pub sd_number_of_reads: u32,
    /// Bisection trial limit when inverting the curve.
    pub sd_volt_tolerance_trials: u32,
    /// Bisection stop tolerance (degrees).
    pub sd_volt_tolerance: f64,
    /// Read-averaging tolerance around the mean (degrees Celsius).
    pub sd_deg_tolerance: f64,
    /// Fit for 2 K to 12 K.
    pub sd_2_12k: CoeffRange,
    /// Fit for 12 K to 24.5 K.
    pub sd_12_24k: CoeffRange,
    /// Fit for 24.5 K to 100 K.
    pub sd_24_100k: CoeffRange,
    /// Fit for 100 K to 475 K.
    pub sd_100_475k: CoeffRange,
}

impl Default for TempParams {
    fn default() -> Self {
        Self {
            dt670_coeff_1: DT670_COEFF_1,
            dt670_coeff_2: DT670_COEFF_2,
            sd_adu_offset: SD_ADU_OFFSET,
            sd_adu_per_volt: SD_ADU_PER_VOLT,
            hg_adu_offset: HG_ADU_OFFSET,
            hg_adu_per_volt: HG_ADU_PER_VOLT,
            sd_number_of_reads: SD_NUM_OF_READS,
            sd_volt_tolerance_trials: SD_VOLT_TOLERANCE_TRIALS,
            sd_volt_tolerance: SD_VOLT_TOLERANCE,
            sd_deg_tolerance: SD_DEG_TOLERANCE,
            sd_2_12k: CoeffRange {
                vu: 1.680000,
                vl: 1.294390,
                coeff: vec![
                    6.429274, -7.514262, -0.725882, -1.117846, -0.562041, -0.360239, -0.229751,
                    -0.135713, -0.068203, -0.029755,
                ],
            },
            sd_12_24k: CoeffRange {
                vu: 1.38373,
                vl: 1.11230,
                coeff: vec![
                    17.244846, -7.964373, 0.625343, -0.105068, 0.292196, -0.344492, 0.271670,
                    -0.151722, 0.121320, -0.035566, 0.045966,
                ],
            },
            sd_24_100k: CoeffRange {
                vu: 1.122751,
                vl: 0.909416,
                coeff: vec![
                    71.818025, -53.799888, 1.669931, 2.314228, 1.566635, 0.723026, -0.149503,
                    0.046876, -0.388555, 0.056889, -0.116823, 0.058580,
                ],
            },
            sd_100_475k: CoeffRange {
                vu: 0.999614,
                vl: 0.079767,
                coeff: vec![
                    287.756797, -194.144823, -3.837903, -1.318325, -0.109120, -0.393265, 0.146911,
                    -0.111192, 0.028877, -0.029286, 0.015619,
                ],
            },
        }
    }
}

impl TempParams {
    /// Converts a digital number into the sensor voltage.
    pub fn adu_to_voltage(&self, adu: u32, smallcam: bool, high_gain: bool) -> f64 {
        if smallcam {
            return self.dt670_coeff_1 + self.dt670_coeff_2 * f64::from(adu);
        }

        let (offset, per_volt) = if high_gain {
            (self.hg_adu_offset, self.hg_adu_per_volt)
        } else {
            (self.sd_adu_offset, self.sd_adu_per_volt)
        };

        (f64::from(adu) - offset) / per_volt
    }

    /// Converts a sensor voltage into a digital number.
    pub fn voltage_to_adu(&self, voltage: f64, smallcam: bool, high_gain: bool) -> f64 {
        if smallcam {
            return (voltage - self.dt670_coeff_1) / self.dt670_coeff_2;
        }

        let (offset, per_volt) = if high_gain {
            (self.hg_adu_offset, self.hg_adu_per_volt)
        } else {
            (self.sd_adu_offset, self.sd_adu_per_volt)
        };

        voltage * per_volt + offset
    }

    fn range_for_voltage(&self, voltage: f64) -> AppResult<&CoeffRange> {
        if self.sd_2_12k.contains(voltage) {
            Ok(&self.sd_2_12k)
        } else if self.sd_12_24k.contains(voltage) {
            Ok(&self.sd_12_24k)
        } else if self.sd_24_100k.contains(voltage) {
            Ok(&self.sd_24_100k)
        } else if voltage <= self.sd_100_475k.vu {
            Ok(&self.sd_100_475k)
        } else {
            Err(CamError::Temperature(format!(
                "coefficients for the voltage ( {voltage} V ) don't exist"
            )))
        }
    }

    /// Calculates the silicon-diode temperature (Celsius) for a sensor
    /// voltage via the Chebyshev series of the matching range.
    pub fn temperature_from_voltage(&self, voltage: f64) -> AppResult<f64> {
        if voltage <= 0.0 {
            return Err(CamError::Temperature(format!(
                "voltage ( {voltage} V ) out of range"
            )));
        }

        let range = self.range_for_voltage(voltage)?;
        let coeff = &range.coeff;

        // Dimensionless variable for the Chebyshev series
        let x = ((voltage - range.vl) - (range.vu - voltage)) / (range.vu - range.vl);

        let mut temperature = -273.15 + coeff[0] + coeff[1] * x;
        let mut tc = vec![1.0, x];

        for i in 2..coeff.len() {
            tc.push(2.0 * x * tc[i - 1] - tc[i - 2]);
            temperature += coeff[i] * tc[i];
        }

        Ok(temperature)
    }

    /// Finds the sensor voltage for a target temperature (Celsius) by
    /// bisecting the matching fit range.
    pub fn voltage_from_temperature(&self, temperature: f64) -> AppResult<f64> {
        let range = if temperature < -261.15 {
            &self.sd_2_12k
        } else if temperature < -248.65 {
            &self.sd_12_24k
        } else if temperature < -173.15 {
            &self.sd_24_100k
        } else {
            &self.sd_100_475k
        };

        let mut vu = range.vu;
        let mut vl = range.vl;
        let mut vmid = (vu + vl) * 0.5;

        for _ in 0..self.sd_volt_tolerance_trials {
            let actual = self.temperature_from_voltage(vmid)?;

            if (actual - temperature).abs() <= self.sd_volt_tolerance {
                break;
            }

            // The curve is monotonically decreasing in voltage
            if actual < temperature {
                vu = vmid;
            } else {
                vl = vmid;
            }
            vmid = (vu + vl) * 0.5;
        }

        Ok(vmid)
    }

    /// Loads constants from a temperature-control file, overriding only the
    /// keys present in the file.
    pub fn load_from(&mut self, path: &Path) -> AppResult<()> {
        let text = std::fs::read_to_string(path)?;
        let mut lines = text.lines().filter(|l| !l.contains("//"));

        while let Some(line) = lines.next() {
            match line.trim() {
                DT670_COEFF_1_KEY => self.dt670_coeff_1 = next_value(&mut lines, line)?,
                DT670_COEFF_2_KEY => self.dt670_coeff_2 = next_value(&mut lines, line)?,
                SD_ADU_OFFSET_KEY => self.sd_adu_offset = next_value(&mut lines, line)?,
                SD_ADU_PER_VOLT_KEY => self.sd_adu_per_volt = next_value(&mut lines, line)?,
                HG_ADU_OFFSET_KEY => self.hg_adu_offset = next_value(&mut lines, line)?,
                HG_ADU_PER_VOLT_KEY => self.hg_adu_per_volt = next_value(&mut lines, line)?,
                SD_NUMBER_OF_READS_KEY => self.sd_number_of_reads = next_value(&mut lines, line)?,
                SD_VOLT_TOLERANCE_TRIALS_KEY => {
                    self.sd_volt_tolerance_trials = next_value(&mut lines, line)?;
                }
                SD_VOLT_TOLERANCE_KEY => self.sd_volt_tolerance = next_value(&mut lines, line)?,
                SD_DEG_TOLERANCE_KEY => self.sd_deg_tolerance = next_value(&mut lines, line)?,
                SD_2_12K_COEFF_KEY => self.sd_2_12k = next_range(&mut lines, line)?,
                SD_12_24K_COEFF_KEY => self.sd_12_24k = next_range(&mut lines, line)?,
                SD_24_100K_COEFF_KEY => self.sd_24_100k = next_range(&mut lines, line)?,
                SD_100_475K_COEFF_KEY => self.sd_100_475k = next_range(&mut lines, line)?,
                _ => {}
            }
        }

        Ok(())
    }

    /// Saves the current constants to a temperature-control file.
    pub fn save_to(&self, path: &Path) -> AppResult<()> {
        let mut out = String::new();
        let _ = writeln!(out, "// _____________________________________________________________");
        let _ = writeln!(out, "//");
        let _ = writeln!(out, "// TEMPERATURE CONTROL FILE");
        let _ = writeln!(out, "// _____________________________________________________________");
        let _ = writeln!(out);

        let mut scalar = |key: &str, value: String| {
            let _ = writeln!(out, "{key}");
            let _ = writeln!(out, "{value}");
            let _ = writeln!(out);
        };

        scalar(DT670_COEFF_1_KEY, format!("{:.10}", self.dt670_coeff_1));
        scalar(DT670_COEFF_2_KEY, format!("{:.10}", self.dt670_coeff_2));
        scalar(SD_ADU_OFFSET_KEY, format!("{:.10}", self.sd_adu_offset));
        scalar(SD_ADU_PER_VOLT_KEY, format!("{:.10}", self.sd_adu_per_volt));
        scalar(HG_ADU_OFFSET_KEY, format!("{:.10}", self.hg_adu_offset));
        scalar(HG_ADU_PER_VOLT_KEY, format!("{:.10}", self.hg_adu_per_volt));
        scalar(SD_NUMBER_OF_READS_KEY, self.sd_number_of_reads.to_string());
        scalar(
            SD_VOLT_TOLERANCE_TRIALS_KEY,
            self.sd_volt_tolerance_trials.to_string(),
        );
        scalar(SD_VOLT_TOLERANCE_KEY, format!("{:.10}", self.sd_volt_tolerance));
        scalar(SD_DEG_TOLERANCE_KEY, format!("{:.10}", self.sd_deg_tolerance));

        let mut range = |key: &str, r: &CoeffRange| {
            let _ = writeln!(out, "{key}");
            let _ = writeln!(out, "{:.10}", r.vu);
            let _ = writeln!(out, "{:.10}", r.vl);
            let _ = writeln!(out, "{}", r.coeff.len());
            for c in &r.coeff {
                let _ = writeln!(out, "{c:.10}");
            }
            let _ = writeln!(out);
        };

        range(SD_2_12K_COEFF_KEY, &self.sd_2_12k);
        range(SD_12_24K_COEFF_KEY, &self.sd_12_24k);
        range(SD_24_100K_COEFF_KEY, &self.sd_24_100k);
        range(SD_100_475K_COEFF_KEY, &self.sd_100_475k);

        std::fs::write(path, out)?;
        Ok(())
    }
}

/// Averages only the samples within `tolerance` of the sample mean.
///
/// Returns 0.0 for an empty slice, and the plain mean when no sample is
/// within tolerance.
pub fn average_within_tolerance(samples: &[f64], tolerance: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;

    let mut sum = 0.0;
    let mut count = 0usize;
    for &sample in samples {
        if (sample - mean).abs() < tolerance {
            sum += sample;
            count += 1;
        }
    }

    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

fn next_value<'a, T: FromStr>(
    lines: &mut impl Iterator<Item = &'a str>,
    key: &str,
) -> AppResult<T> {
    let line = lines
        .next()
        .ok_or_else(|| CamError::Temperature(format!("missing value for {key}")))?;
    line.trim()
        .parse::<T>()
        .map_err(|_| CamError::Temperature(format!("failed to convert value for {key}: {line}")))
}

fn next_range<'a>(lines: &mut impl Iterator<Item = &'a str>, key: &str) -> AppResult<CoeffRange> {
    let vu: f64 = next_value(lines, key)?;
    let vl: f64 = next_value(lines, key)?;
    let count: usize = next_value(lines, key)?;

    let mut coeff = Vec::with_capacity(count);
    for _ in 0..count {
        coeff.push(next_value(lines, key)?);
    }

    Ok(CoeffRange { vu, vl, coeff })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversions() {
        assert!((c2k(0.0) - 273.15).abs() < 1e-9);
        assert!((k2c(273.15)).abs() < 1e-9);
        assert!((f2k(32.0) - (-402.07)).abs() < 1e-9);
    }

    #[test]
    fn adu_voltage_round_trip() {
        let params = TempParams::default();

        let v = params.adu_to_voltage(3000, false, false);
        assert!((v - (3000.0 - 2045.0) / 1366.98).abs() < 1e-9);
        let adu = params.voltage_to_adu(v, false, false);
        assert!((adu - 3000.0).abs() < 1e-6);

        // High gain uses its own scale
        let v_hg = params.adu_to_voltage(3000, false, true);
        assert!((v_hg - (3000.0 + 3108.0) / 7321.0).abs() < 1e-9);

        // SmallCam is linear in the DT-670 coefficients
        let v_sc = params.adu_to_voltage(1000, true, false);
        assert!((v_sc - (0.03 + 0.0000251 * 1000.0)).abs() < 1e-12);
        let adu_sc = params.voltage_to_adu(v_sc, true, false);
        assert!((adu_sc - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn sensor_curve_hits_room_temperature_anchor() {
        let params = TempParams::default();
        // DT-670 standard curve: 300 K reads 0.559786 V
        let t = params
            .temperature_from_voltage(0.559786)
            .expect("temperature");
        assert!((t - k2c(300.0)).abs() < 1.5, "got {t}");
    }

    #[test]
    fn sensor_curve_is_monotonic() {
        let params = TempParams::default();
        let warm = params.temperature_from_voltage(0.5).expect("temperature");
        let cold = params.temperature_from_voltage(1.0).expect("temperature");
        assert!(warm > cold);
    }

    #[test]
    fn voltage_out_of_range_is_rejected() {
        let params = TempParams::default();
        assert!(params.temperature_from_voltage(0.0).is_err());
        assert!(params.temperature_from_voltage(-1.0).is_err());
        assert!(params.temperature_from_voltage(1.7).is_err());
    }

    #[test]
    fn bisection_inverts_the_curve() {
        let params = TempParams::default();
        for v in [0.3, 0.6, 0.95, 1.0, 1.2, 1.5] {
            let t = params.temperature_from_voltage(v).expect("temperature");
            let v_back = params.voltage_from_temperature(t).expect("voltage");
            assert!((v_back - v).abs() < 1e-3, "v={v} came back {v_back}");
        }
    }

    #[test]
    fn averaging_rejects_outliers() {
        let avg = average_within_tolerance(&[-100.0, -100.5, -99.5, 50.0], 3.0);
        assert!((avg - (-100.0)).abs() < 0.2, "got {avg}");

        assert_eq!(average_within_tolerance(&[], 3.0), 0.0);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tempctrl.txt");

        let mut saved = TempParams::default();
        saved.sd_adu_offset = 2000.0;
        saved.sd_number_of_reads = 10;
        saved.sd_2_12k.coeff[0] = 6.5;
        saved.save_to(&path).expect("save");

        let mut loaded = TempParams::default();
        loaded.load_from(&path).expect("load");

        assert!((loaded.sd_adu_offset - 2000.0).abs() < 1e-6);
        assert_eq!(loaded.sd_number_of_reads, 10);
        assert!((loaded.sd_2_12k.coeff[0] - 6.5).abs() < 1e-6);
        assert_eq!(loaded.sd_2_12k.coeff.len(), saved.sd_2_12k.coeff.len());
    }

    #[test]
    fn partial_file_overrides_only_present_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.txt");
        std::fs::write(&path, "[TMPCTRL_SDNUMBER_OF_READS]\n5\n").expect("write");

        let mut params = TempParams::default();
        params.load_from(&path).expect("load");

        assert_eq!(params.sd_number_of_reads, 5);
        assert!((params.sd_adu_offset - SD_ADU_OFFSET).abs() < 1e-9);
    }
}
