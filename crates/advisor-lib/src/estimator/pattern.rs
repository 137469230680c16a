//! Workload pattern classification
//!
//! Labels a node's CPU series with one [`PatternClass`]. Rules are applied
//! in order and the first match wins:
//!
//! 1. fewer than `min_samples` points: `consistent`
//! 2. spike frequency above `outlier_frequency`: `outlier_heavy`
//! 3. coefficient of variation below `consistent_cv`, or standard deviation
//!    below `consistent_std_dev` points: `consistent`
//! 4. busiest/quietest hour-of-day mean ratio at least `peak_ratio`, or
//!    weekday/weekend mean ratio above `weekday_ratio`: `peaks_and_valleys`
//! 5. otherwise `random`
//!
//! A spike is a value above `Q3 + spike_iqr_multiplier * IQR` that is also
//! at least `spike_min_margin` points above Q3.
//!
//! Business hours are 09:00 through 17:59 UTC.

use crate::models::{PatternClass, SeriesPoint};
use crate::stats::{coefficient_of_variation, percentile, sorted_copy, std_dev};
use chrono::{Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};

/// Below this many samples the series is too short to say anything
const MIN_SAMPLES_FOR_CLASSIFICATION: usize = 10;

/// Two days of hourly samples before time-of-day profiles are trusted
const MIN_SAMPLES_FOR_PROFILE: usize = 48;

/// Profile means are floored here so an idle hour does not divide by zero
const QUIET_FLOOR_PCT: f64 = 1.0;

const BUSINESS_HOURS: std::ops::RangeInclusive<u32> = 9..=17;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternThresholds {
    pub min_samples: usize,
    pub consistent_cv: f64,
    pub consistent_std_dev: f64,
    pub spike_iqr_multiplier: f64,
    pub spike_min_margin: f64,
    pub outlier_frequency: f64,
    pub peak_ratio: f64,
    pub weekday_ratio: f64,
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self {
            min_samples: MIN_SAMPLES_FOR_CLASSIFICATION,
            consistent_cv: 0.15,
            consistent_std_dev: 5.0,
            spike_iqr_multiplier: 1.5,
            spike_min_margin: 5.0,
            outlier_frequency: 0.15,
            peak_ratio: 1.5,
            weekday_ratio: 1.5,
        }
    }
}

/// Measurements behind a classification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub class: PatternClass,
    pub sample_count: usize,
    pub coefficient_of_variation: f64,
    pub std_dev: f64,
    pub spike_frequency: f64,
    /// `None` when the series is too short for a daily profile
    pub peak_ratio: Option<f64>,
    /// `None` without both weekday and weekend samples
    pub weekday_ratio: Option<f64>,
    pub business_hours_mean: Option<f64>,
    pub off_hours_mean: Option<f64>,
    /// UTC hour of day holding the most spikes
    pub spike_peak_hour: Option<u32>,
}

impl PatternAnalysis {
    fn too_short(sample_count: usize) -> Self {
        Self {
            class: PatternClass::Consistent,
            sample_count,
            coefficient_of_variation: 0.0,
            std_dev: 0.0,
            spike_frequency: 0.0,
            peak_ratio: None,
            weekday_ratio: None,
            business_hours_mean: None,
            off_hours_mean: None,
            spike_peak_hour: None,
        }
    }

    /// One-line description of what drove the class
    pub fn notes(&self, thresholds: &PatternThresholds) -> String {
        if self.sample_count < thresholds.min_samples.max(1) {
            return format!("only {} samples, too few to classify", self.sample_count);
        }
        match self.class {
            PatternClass::Consistent => {
                format!("steady load, std dev {:.1} points", self.std_dev)
            }
            PatternClass::OutlierHeavy => {
                let mut note = format!("{:.0}% of samples are spikes", self.spike_frequency * 100.0);
                if let Some(hour) = self.spike_peak_hour {
                    note.push_str(&format!(", most often around {:02}:00 UTC", hour));
                }
                note
            }
            PatternClass::PeaksAndValleys => match (self.business_hours_mean, self.off_hours_mean) {
                (Some(business), Some(off)) if self.peak_ratio.is_some_and(|r| r >= thresholds.peak_ratio) => {
                    format!("business hours average {:.1}% vs {:.1}% off hours", business, off)
                }
                _ => format!(
                    "weekday load {:.1}x weekend load",
                    self.weekday_ratio.unwrap_or(1.0)
                ),
            },
            PatternClass::Random => format!(
                "irregular load, coefficient of variation {:.2}",
                self.coefficient_of_variation
            ),
        }
    }
}

pub fn classify(series: &[SeriesPoint], thresholds: &PatternThresholds) -> PatternClass {
    analyze(series, thresholds).class
}

pub fn analyze(series: &[SeriesPoint], thresholds: &PatternThresholds) -> PatternAnalysis {
    let values: Vec<f64> = series.iter().map(|p| p.value).collect();

    if values.len() < thresholds.min_samples.max(1) {
        return PatternAnalysis::too_short(values.len());
    }

    let cv = coefficient_of_variation(&values);
    let sd = std_dev(&values);
    let fence = spike_fence(&values, thresholds);
    let spikes = values.iter().filter(|v| **v > fence).count() as f64 / values.len() as f64;
    let (business, off) = business_hours_means(series);
    let (peak, weekday) = if series.len() >= MIN_SAMPLES_FOR_PROFILE {
        (hourly_peak_ratio(series), weekday_weekend_ratio(series))
    } else {
        (None, None)
    };

    let class = if spikes > thresholds.outlier_frequency {
        PatternClass::OutlierHeavy
    } else if cv < thresholds.consistent_cv || sd < thresholds.consistent_std_dev {
        PatternClass::Consistent
    } else if peak.is_some_and(|r| r >= thresholds.peak_ratio)
        || weekday.is_some_and(|r| r > thresholds.weekday_ratio)
    {
        PatternClass::PeaksAndValleys
    } else {
        PatternClass::Random
    };

    PatternAnalysis {
        class,
        sample_count: values.len(),
        coefficient_of_variation: cv,
        std_dev: sd,
        spike_frequency: spikes,
        peak_ratio: peak,
        weekday_ratio: weekday,
        business_hours_mean: business,
        off_hours_mean: off,
        spike_peak_hour: spike_peak_hour(series, fence),
    }
}

/// Values above this count as spikes
fn spike_fence(values: &[f64], thresholds: &PatternThresholds) -> f64 {
    let sorted = sorted_copy(values);
    let q1 = percentile(&sorted, 25.0);
    let q3 = percentile(&sorted, 75.0);
    (q3 + thresholds.spike_iqr_multiplier * (q3 - q1)).max(q3 + thresholds.spike_min_margin)
}

/// Earliest hour wins a tie
fn spike_peak_hour(series: &[SeriesPoint], fence: f64) -> Option<u32> {
    let mut counts = [0u32; 24];
    for point in series.iter().filter(|p| p.value > fence) {
        counts[point.timestamp.hour() as usize] += 1;
    }
    let (hour, count) = counts
        .iter()
        .enumerate()
        .fold((0, 0), |best, (hour, &count)| if count > best.1 { (hour, count) } else { best });
    (count > 0).then_some(hour as u32)
}

fn business_hours_means(series: &[SeriesPoint]) -> (Option<f64>, Option<f64>) {
    let (mut business_sum, mut business_n) = (0.0, 0u32);
    let (mut off_sum, mut off_n) = (0.0, 0u32);
    for point in series {
        if BUSINESS_HOURS.contains(&point.timestamp.hour()) {
            business_sum += point.value;
            business_n += 1;
        } else {
            off_sum += point.value;
            off_n += 1;
        }
    }
    let mean = |sum: f64, n: u32| (n > 0).then(|| sum / f64::from(n));
    (mean(business_sum, business_n), mean(off_sum, off_n))
}

/// Busiest over quietest hour-of-day mean
fn hourly_peak_ratio(series: &[SeriesPoint]) -> Option<f64> {
    let mut sums = [0.0f64; 24];
    let mut counts = [0u32; 24];
    for point in series {
        let hour = point.timestamp.hour() as usize;
        sums[hour] += point.value;
        counts[hour] += 1;
    }

    let means: Vec<f64> = sums
        .iter()
        .zip(counts.iter())
        .filter(|(_, c)| **c > 0)
        .map(|(s, c)| s / f64::from(*c))
        .collect();
    if means.len() < 2 {
        return None;
    }

    let busiest = means.iter().copied().fold(f64::MIN, f64::max);
    let quietest = means.iter().copied().fold(f64::MAX, f64::min);
    Some(busiest.max(QUIET_FLOOR_PCT) / quietest.max(QUIET_FLOOR_PCT))
}

fn weekday_weekend_ratio(series: &[SeriesPoint]) -> Option<f64> {
    let (mut weekday_sum, mut weekday_n) = (0.0, 0u32);
    let (mut weekend_sum, mut weekend_n) = (0.0, 0u32);
    for point in series {
        match point.timestamp.weekday() {
            Weekday::Sat | Weekday::Sun => {
                weekend_sum += point.value;
                weekend_n += 1;
            }
            _ => {
                weekday_sum += point.value;
                weekday_n += 1;
            }
        }
    }
    if weekday_n == 0 || weekend_n == 0 {
        return None;
    }

    let weekday_mean = (weekday_sum / f64::from(weekday_n)).max(QUIET_FLOOR_PCT);
    let weekend_mean = (weekend_sum / f64::from(weekend_n)).max(QUIET_FLOOR_PCT);
    Some(weekday_mean / weekend_mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    /// Hourly series starting Monday 2024-04-01 00:00
    fn hourly(hours: usize, value: impl Fn(usize) -> f64) -> Vec<SeriesPoint> {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        (0..hours)
            .map(|i| SeriesPoint {
                timestamp: start + Duration::hours(i as i64),
                value: value(i),
            })
            .collect()
    }

    #[test]
    fn test_short_series_is_consistent() {
        let series = hourly(9, |i| if i % 2 == 0 { 5.0 } else { 95.0 });
        assert_eq!(
            classify(&series, &PatternThresholds::default()),
            PatternClass::Consistent
        );
    }

    #[test]
    fn test_flat_load_is_consistent() {
        let series = hourly(720, |i| 40.0 + (i % 3) as f64);
        assert_eq!(
            classify(&series, &PatternThresholds::default()),
            PatternClass::Consistent
        );
    }

    #[test]
    fn test_business_hours_are_peaks_and_valleys() {
        let series = hourly(720, |i| if (9..18).contains(&(i % 24)) { 80.0 } else { 20.0 });
        let analysis = analyze(&series, &PatternThresholds::default());
        assert_eq!(analysis.class, PatternClass::PeaksAndValleys);
        assert!((analysis.peak_ratio.unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(analysis.business_hours_mean, Some(80.0));
        assert_eq!(analysis.off_hours_mean, Some(20.0));
        assert_eq!(
            analysis.notes(&PatternThresholds::default()),
            "business hours average 80.0% vs 20.0% off hours"
        );
    }

    #[test]
    fn test_weekday_load_is_peaks_and_valleys() {
        // Constant within a day, so only the weekly profile differs
        let series = hourly(28 * 24, |i| if (i / 24) % 7 < 5 { 60.0 } else { 20.0 });
        let analysis = analyze(&series, &PatternThresholds::default());
        assert_eq!(analysis.class, PatternClass::PeaksAndValleys);
        assert!((analysis.weekday_ratio.unwrap() - 3.0).abs() < 1e-9);
        assert!((analysis.peak_ratio.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_frequent_spikes_are_outlier_heavy() {
        let series = hourly(720, |i| if i % 5 == 0 { 90.0 } else { 10.0 });
        let analysis = analyze(&series, &PatternThresholds::default());
        assert_eq!(analysis.class, PatternClass::OutlierHeavy);
        assert!((analysis.spike_frequency - 0.2).abs() < 1e-9);
        assert!(analysis.notes(&PatternThresholds::default()).starts_with("20% of samples are spikes"));
    }

    #[test]
    fn test_spikes_clustered_at_one_hour() {
        // Nightly batch at 02:00 over a quiet baseline
        let series = hourly(720, |i| if i % 24 == 2 { 95.0 } else { 10.0 + (i % 4) as f64 });
        let analysis = analyze(&series, &PatternThresholds::default());
        assert_eq!(analysis.spike_peak_hour, Some(2));
    }

    #[test]
    fn test_short_series_notes() {
        let series = hourly(4, |_| 50.0);
        let analysis = analyze(&series, &PatternThresholds::default());
        assert_eq!(analysis.sample_count, 4);
        assert_eq!(
            analysis.notes(&PatternThresholds::default()),
            "only 4 samples, too few to classify"
        );
    }

    #[test]
    fn test_unstructured_variation_is_random() {
        // Period 11 is coprime with both 24 and 168, so no profile emerges
        let series = hourly(720, |i| 20.0 + 6.0 * ((i * 7) % 11) as f64);
        assert_eq!(
            classify(&series, &PatternThresholds::default()),
            PatternClass::Random
        );
    }

    #[test]
    fn test_classification_is_stable() {
        let series = hourly(500, |i| ((i * 37) % 100) as f64);
        let thresholds = PatternThresholds::default();
        assert_eq!(analyze(&series, &thresholds), analyze(&series, &thresholds));
    }
}
