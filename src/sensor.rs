//! pH probe and calibration curves.
//!
//! A probe reports a raw integer signal. Turning that into a pH value needs a calibration curve,
//! fitted once from `(signal, reference)` pairs collected in buffer solutions. The fitting
//! algorithm sits behind [`Calibrator`]; [`LinearFit`] (ordinary least squares) is the default.

use crate::device::{Capability, DeviceHandle};
use crate::error::{AppResult, FluidicsError};
use crate::transport::{SerialTransport, Transport, TransportSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// A fitted calibration curve.
pub trait Predictor {
    /// Map a raw signal to a calibrated value.
    fn predict(&self, x: f64) -> f64;
}

/// Fits calibration curves.
pub trait Calibrator {
    /// Fit `(x, y)` samples.
    fn fit(&self, samples: &[(f64, f64)]) -> AppResult<Box<dyn Predictor>>;
}

/// Straight line `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// Gradient
    pub slope: f64,
    /// Value at x = 0
    pub intercept: f64,
}

impl Predictor for LinearModel {
    fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least squares.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearFit;

impl LinearFit {
    /// Fit and return the concrete model.
    pub fn fit_line(samples: &[(f64, f64)]) -> AppResult<LinearModel> {
        if samples.len() < 2 {
            return Err(FluidicsError::State(format!(
                "linear fit needs at least 2 samples, got {}",
                samples.len()
            )));
        }
        #[allow(clippy::cast_precision_loss)]
        let n = samples.len() as f64;
        let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;

        let sxx: f64 = samples.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        let sxy: f64 = samples
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();

        if sxx.abs() < f64::EPSILON {
            return Err(FluidicsError::State(
                "linear fit needs at least 2 distinct x values".into(),
            ));
        }

        let slope = sxy / sxx;
        Ok(LinearModel {
            slope,
            intercept: mean_y - slope * mean_x,
        })
    }
}

impl Calibrator for LinearFit {
    fn fit(&self, samples: &[(f64, f64)]) -> AppResult<Box<dyn Predictor>> {
        Ok(Box::new(Self::fit_line(samples)?))
    }
}

/// Something that produces one raw reading per call.
pub trait RawSignal {
    /// Take one reading.
    fn read_raw(&mut self) -> AppResult<f64>;
}

/// Arduino-style probe: send `<pH>`, receive one integer line.
#[derive(Debug)]
pub struct SerialPhSource<T> {
    transport: T,
    handle: DeviceHandle,
}

impl SerialPhSource<SerialTransport> {
    /// Open the probe on a serial port.
    pub fn open(settings: &TransportSettings) -> AppResult<Self> {
        let mut source = Self::new(SerialTransport::open(settings)?);
        source.handle.set_connection(settings);
        info!(device = %source.handle, port = %settings.path, "pH probe connected");
        Ok(source)
    }
}

impl<T: Transport> SerialPhSource<T> {
    /// Read a probe over an already-open transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            handle: DeviceHandle::new("pH", 0, Capability::Sensor),
        }
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> RawSignal for SerialPhSource<T> {
    fn read_raw(&mut self) -> AppResult<f64> {
        let label = self.handle.label();
        self.transport.write(b"<pH>")?;
        let mut raw = self.transport.read_until_timeout()?;
        if raw.is_empty() {
            raw = self.transport.read_until_timeout()?;
        }
        let text = String::from_utf8_lossy(&raw);
        let line = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| FluidicsError::transport(&label, "no response"))?;
        let value = line.parse::<i64>().map_err(|_| {
            FluidicsError::protocol(&label, format!("expected integer reading, got '{line}'"))
        })?;
        #[allow(clippy::cast_precision_loss)]
        Ok(value as f64)
    }
}

/// Averaging options for [`PhProbe::voltage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Wait before sampling, letting the reading settle
    pub delay: Duration,
    /// Readings averaged per sample
    pub average: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(30),
            average: 10,
        }
    }
}

/// Probe plus its (optional) calibration curve.
pub struct PhProbe<S> {
    source: S,
    settings: ProbeSettings,
    predictor: Option<Box<dyn Predictor>>,
}

impl<S> std::fmt::Debug for PhProbe<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhProbe")
            .field("settings", &self.settings)
            .field("calibrated", &self.predictor.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: RawSignal> PhProbe<S> {
    /// Uncalibrated probe.
    pub fn new(source: S, settings: ProbeSettings) -> Self {
        Self {
            source,
            settings,
            predictor: None,
        }
    }

    /// Whether a calibration curve is loaded.
    pub fn is_calibrated(&self) -> bool {
        self.predictor.is_some()
    }

    /// Raw signal source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// One raw reading.
    pub fn read_raw(&mut self) -> AppResult<f64> {
        self.source.read_raw()
    }

    /// Mean of `average` readings taken after the settle delay.
    pub fn voltage(&mut self) -> AppResult<f64> {
        if self.settings.average == 0 {
            return Err(FluidicsError::State("probe averages zero readings".into()));
        }
        if !self.settings.delay.is_zero() {
            std::thread::sleep(self.settings.delay);
        }
        let mut sum = 0.0;
        for _ in 0..self.settings.average {
            sum += self.source.read_raw()?;
        }
        let mean = sum / f64::from(self.settings.average);
        debug!(mean, readings = self.settings.average, "Probe sampled");
        Ok(mean)
    }

    /// Fit a curve from `(signal, reference)` samples and keep it.
    pub fn calibrate(&mut self, calibrator: &dyn Calibrator, samples: &[(f64, f64)]) -> AppResult<()> {
        self.predictor = Some(calibrator.fit(samples)?);
        info!(samples = samples.len(), "Probe calibrated");
        Ok(())
    }

    /// Install an already-fitted curve.
    pub fn set_predictor(&mut self, predictor: Box<dyn Predictor>) {
        self.predictor = Some(predictor);
    }

    /// Calibrated reading. Fails before calibration without touching the probe.
    pub fn measure(&mut self) -> AppResult<f64> {
        if self.predictor.is_none() {
            return Err(FluidicsError::State("no calibration curve loaded".into()));
        }
        let x = self.voltage()?;
        self.predictor
            .as_ref()
            .map(|p| p.predict(x))
            .ok_or_else(|| FluidicsError::State("no calibration curve loaded".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Fixed(Vec<f64>);

    impl RawSignal for Fixed {
        fn read_raw(&mut self) -> AppResult<f64> {
            self.0
                .pop()
                .ok_or_else(|| FluidicsError::transport("fixed", "exhausted"))
        }
    }

    struct CountingPredictor(Rc<Cell<u32>>);

    impl Predictor for CountingPredictor {
        fn predict(&self, x: f64) -> f64 {
            self.0.set(self.0.get() + 1);
            x
        }
    }

    fn quick() -> ProbeSettings {
        ProbeSettings {
            delay: Duration::ZERO,
            average: 2,
        }
    }

    #[test]
    fn least_squares_recovers_exact_line() {
        let model = LinearFit::fit_line(&[(100.0, 4.0), (200.0, 7.0), (300.0, 10.0)]).unwrap();
        assert!((model.slope - 0.03).abs() < 1e-12);
        assert!((model.intercept - 1.0).abs() < 1e-12);
        assert!((model.predict(250.0) - 8.5).abs() < 1e-12);
    }

    #[test]
    fn fit_needs_two_distinct_points() {
        assert!(matches!(
            LinearFit::fit_line(&[(1.0, 4.0)]),
            Err(FluidicsError::State(_))
        ));
        assert!(matches!(
            LinearFit::fit_line(&[(1.0, 4.0), (1.0, 7.0)]),
            Err(FluidicsError::State(_))
        ));
    }

    #[test]
    fn measure_before_calibration_is_a_state_error() {
        let mut probe = PhProbe::new(Fixed(vec![1.0, 1.0]), quick());
        assert!(matches!(probe.measure(), Err(FluidicsError::State(_))));
        // the source was never read
        assert_eq!(probe.source().0.len(), 2);
    }

    #[test]
    fn measure_predicts_from_averaged_voltage() {
        let calls = Rc::new(Cell::new(0));
        let mut probe = PhProbe::new(Fixed(vec![10.0, 20.0]), quick());
        probe.set_predictor(Box::new(CountingPredictor(Rc::clone(&calls))));
        assert!((probe.measure().unwrap() - 15.0).abs() < 1e-12);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn serial_source_parses_integer_line() {
        let transport = MockTransport::new().with_responses([b"512\r\n".to_vec()]);
        let mut source = SerialPhSource::new(transport);
        assert!((source.read_raw().unwrap() - 512.0).abs() < 1e-12);
        assert_eq!(source.transport().writes(), &[b"<pH>".to_vec()]);
    }

    #[test]
    fn serial_source_rejects_garbage() {
        let transport = MockTransport::new().with_responses([b"ph?\r\n".to_vec()]);
        let mut source = SerialPhSource::new(transport);
        assert!(matches!(
            source.read_raw(),
            Err(FluidicsError::Protocol { .. })
        ));
    }
}
