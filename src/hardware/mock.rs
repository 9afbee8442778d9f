//! Simulated beamline
//!
//! An in-memory process-variable bus that behaves enough like the 13-BM-D
//! hardware to run complete collections without a facility:
//!
//! - Motor records: a put to `.VAL` moves `.RBV` to the target immediately
//!   (unless the motor is stalled).
//! - Detector: `Acquire = 1` arms the camera. In internal trigger mode frames
//!   start at once; in external modes they start when the rotation stage is
//!   commanded while the camera is armed. Each read of the frame counter
//!   advances it by one frame until `NumImages` frames have been taken, then
//!   the camera disarms.
//! - Pulse generator: `UNITSTOCOUNTS(...)` on the command register answers
//!   `%<counts>` on the reply register.
//!
//! Every access is logged so tests can assert exact write sequences, and
//! faults can be injected per key.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{motor_field, Settings};
use crate::error::{AcqError, AppResult};
use crate::hardware::pv::{ProcessVariables, PvClient, PvValue};

/// Encoder counts per rotation reported by the simulated controller.
pub const SIM_COUNTS_PER_ROTATION: i64 = 360_000;

/// One logged access.
#[derive(Debug, Clone, PartialEq)]
pub enum PvCall {
    /// A read
    Get(String),
    /// A write
    Put {
        /// Key written
        key: String,
        /// Value written
        value: PvValue,
        /// Whether completion was awaited
        wait: bool,
    },
}

#[derive(Debug, Clone)]
struct SimKeys {
    rotation_val: String,
    acquire: String,
    armed: String,
    trigger_mode: String,
    num_images: String,
    array_counter: String,
    array_counter_rbv: String,
    tiff_file_number: String,
    command_out: String,
    command_in: String,
}

#[derive(Debug, Default)]
struct SimState {
    values: HashMap<String, PvValue>,
    log: Vec<PvCall>,
    acquiring: bool,
    triggered: bool,
    images_taken: i64,
    stall_detector: bool,
    stalled_motors: HashSet<String>,
    failing_keys: HashSet<String>,
    hanging_keys: HashSet<String>,
}

/// In-memory beamline.
#[derive(Clone)]
pub struct SimulatedBeamline {
    keys: Arc<SimKeys>,
    counts_per_rotation: i64,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBeamline {
    /// Build a beamline whose record names follow `settings`, parked at the XRD geometry.
    pub fn new(settings: &Settings) -> Self {
        let det = &settings.detector;
        let pso = &settings.pso;
        let keys = SimKeys {
            rotation_val: format!("{}.{}", settings.rotation.motor, motor_field::VAL),
            acquire: det.acquire(),
            armed: det.armed(),
            trigger_mode: det.trigger_mode(),
            num_images: det.num_images(),
            array_counter: det.array_counter(),
            array_counter_rbv: det.array_counter_rbv(),
            tiff_file_number: det.tiff_file_number(),
            command_out: pso.command_out(),
            command_in: pso.command_in(),
        };

        let mut values = HashMap::new();
        let mut motor = |name: &str, position: f64, low: f64, high: f64| {
            let field = |f: &str| format!("{}.{}", name, f);
            values.insert(field(motor_field::VAL), PvValue::Float(position));
            values.insert(field(motor_field::RBV), PvValue::Float(position));
            values.insert(field(motor_field::LLM), PvValue::Float(low));
            values.insert(field(motor_field::HLM), PvValue::Float(high));
            values.insert(field(motor_field::VELO), PvValue::Float(10.0));
            values.insert(field(motor_field::VMAX), PvValue::Float(20.0));
            values.insert(field(motor_field::DIR), PvValue::Int(0));
            values.insert(field(motor_field::ACCL), PvValue::Float(0.5));
        };
        motor(&settings.rotation.motor, 0.0, -360.0, 360.0);
        motor(&settings.sample_stage.x, 0.0, -50.0, 50.0);
        motor(&settings.sample_stage.y, 0.0, -50.0, 50.0);
        motor(&settings.sample_stage.z, 0.0, -50.0, 50.0);
        let geometry = &settings.geometry;
        motor(&geometry.detector_x, geometry.xrd_x, -500.0, 500.0);
        motor(&geometry.detector_z, geometry.xrd_z, -500.0, 500.0);

        let seeds: Vec<(String, PvValue)> = vec![
            (pso.axis_name(), "X".into()),
            (pso.command_out(), "".into()),
            (pso.command_in(), "".into()),
            (pso.counts_per_rotation(), PvValue::Int(0)),
            (pso.counts_per_step(), PvValue::Int(1)),
            (pso.encoder_input(), PvValue::Int(3)),
            (pso.pulse_width(), PvValue::Float(10.0)),
            (pso.start_taxi(), PvValue::Float(0.0)),
            (pso.end_taxi(), PvValue::Float(0.0)),
            (det.acquire_time(), PvValue::Float(1.0)),
            (det.acquire(), PvValue::Int(0)),
            (det.armed(), PvValue::Int(0)),
            (det.num_images(), PvValue::Int(1)),
            (det.trigger_mode(), PvValue::Int(0)),
            (det.array_counter(), PvValue::Int(0)),
            (det.array_counter_rbv(), PvValue::Int(0)),
            (det.file_template(), "%s%s_%4.4d_0001.tif".into()),
            (det.file_name(), "detector".into()),
            (det.file_number(), PvValue::Int(1)),
            (det.file_path(), "/DAC/previous/".into()),
            (det.tiff_file_template(), "%s%s_%4.4d.tif".into()),
            (det.tiff_file_name(), "previous".into()),
            (det.tiff_file_number(), PvValue::Int(1)),
            (det.tiff_file_path(), "/DAC/previous/".into()),
            (det.filter_count(), PvValue::Int(1)),
            (det.filter_type(), PvValue::Int(0)),
            (det.filter_enable(), PvValue::Int(0)),
            (settings.shutter.pv.clone(), PvValue::Int(0)),
        ];
        values.extend(seeds);

        Self {
            keys: Arc::new(keys),
            counts_per_rotation: SIM_COUNTS_PER_ROTATION,
            state: Arc::new(Mutex::new(SimState {
                values,
                ..SimState::default()
            })),
        }
    }

    /// Handle used by the acquisition core.
    pub fn client(&self) -> PvClient {
        PvClient::new(Arc::new(self.clone()))
    }

    /// Keep the camera armed without producing frames.
    pub fn stall_detector(&self, stalled: bool) {
        self.state.lock().stall_detector = stalled;
    }

    /// Freeze the readback of a motor record.
    pub fn stall_motor(&self, motor: &str) {
        self.state.lock().stalled_motors.insert(motor.to_string());
    }

    /// Make every access to `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.state.lock().failing_keys.insert(key.to_string());
    }

    /// Make waited puts to `key` never complete.
    pub fn hang_on(&self, key: &str) {
        self.state.lock().hanging_keys.insert(key.to_string());
    }

    /// Remove injected failures and hangs.
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.failing_keys.clear();
        state.hanging_keys.clear();
    }

    /// Current value of a key.
    pub fn value(&self, key: &str) -> Option<PvValue> {
        self.state.lock().values.get(key).cloned()
    }

    /// Overwrite a value without side effects or logging.
    pub fn set_value(&self, key: &str, value: impl Into<PvValue>) {
        self.state.lock().values.insert(key.to_string(), value.into());
    }

    /// Every access so far.
    pub fn calls(&self) -> Vec<PvCall> {
        self.state.lock().log.clone()
    }

    /// Every write so far, in order.
    pub fn puts(&self) -> Vec<(String, PvValue)> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|call| match call {
                PvCall::Put { key, value, .. } => Some((key.clone(), value.clone())),
                PvCall::Get(_) => None,
            })
            .collect()
    }

    /// Values written to one key, in order.
    pub fn puts_to(&self, key: &str) -> Vec<PvValue> {
        self.puts()
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect()
    }

    /// Command strings written to the pulse generator, in order.
    pub fn pso_commands(&self) -> Vec<String> {
        self.puts_to(&self.keys.command_out)
            .into_iter()
            .map(|v| v.as_string())
            .collect()
    }

    /// Forget the access log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn apply_put(&self, state: &mut SimState, key: &str, value: &PvValue) {
        state.values.insert(key.to_string(), value.clone());
        let keys = &self.keys;

        if let Some(motor) = key.strip_suffix(".VAL") {
            if !state.stalled_motors.contains(motor) {
                state
                    .values
                    .insert(format!("{}.{}", motor, motor_field::RBV), value.clone());
            }
            if key == keys.rotation_val && state.acquiring {
                state.triggered = true;
            }
        } else if key == keys.acquire {
            if value.as_i64() == Some(1) {
                let internal = state
                    .values
                    .get(&keys.trigger_mode)
                    .and_then(PvValue::as_i64)
                    .unwrap_or(0)
                    == 0;
                state.acquiring = true;
                state.triggered = internal;
                state.images_taken = 0;
                state.values.insert(keys.armed.clone(), PvValue::Int(1));
            } else {
                state.acquiring = false;
                state.triggered = false;
                state.values.insert(keys.armed.clone(), PvValue::Int(0));
            }
        } else if key == keys.array_counter {
            state
                .values
                .insert(keys.array_counter_rbv.clone(), value.clone());
        } else if key == keys.command_out && value.as_string().starts_with("UNITSTOCOUNTS(") {
            state.values.insert(
                keys.command_in.clone(),
                PvValue::Str(format!("%{}", self.counts_per_rotation)),
            );
        }
    }

    fn advance_frame(&self, state: &mut SimState) {
        if !state.acquiring || !state.triggered || state.stall_detector {
            return;
        }
        let keys = &self.keys;
        for key in [&keys.array_counter_rbv, &keys.tiff_file_number] {
            let next = state.values.get(key).and_then(PvValue::as_i64).unwrap_or(0) + 1;
            state.values.insert(key.clone(), PvValue::Int(next));
        }
        state.images_taken += 1;
        let wanted = state
            .values
            .get(&keys.num_images)
            .and_then(PvValue::as_i64)
            .unwrap_or(1);
        if state.images_taken >= wanted {
            state.acquiring = false;
            state.triggered = false;
            state.values.insert(keys.armed.clone(), PvValue::Int(0));
            state.values.insert(keys.acquire.clone(), PvValue::Int(0));
        }
    }
}

#[async_trait]
impl ProcessVariables for SimulatedBeamline {
    async fn get(&self, key: &str) -> AppResult<PvValue> {
        let mut state = self.state.lock();
        state.log.push(PvCall::Get(key.to_string()));
        if state.failing_keys.contains(key) {
            return Err(AcqError::Hardware(format!("injected fault reading {}", key)));
        }
        if key == self.keys.array_counter_rbv || key == self.keys.tiff_file_number {
            self.advance_frame(&mut state);
        }
        state
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| AcqError::Hardware(format!("unknown process variable {}", key)))
    }

    async fn put(&self, key: &str, value: PvValue, wait: bool) -> AppResult<()> {
        let hang = {
            let mut state = self.state.lock();
            state.log.push(PvCall::Put {
                key: key.to_string(),
                value: value.clone(),
                wait,
            });
            if state.failing_keys.contains(key) {
                return Err(AcqError::Hardware(format!("injected fault writing {}", key)));
            }
            self.apply_put(&mut state, key, &value);
            wait && state.hanging_keys.contains(key)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
