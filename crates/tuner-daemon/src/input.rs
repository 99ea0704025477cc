//! Rotary encoder input.
//!
//! Two encoders (station, volume), each with a push button, are sampled at
//! a fixed interval on a blocking thread.  Quadrature samples go through a
//! transition table that drops illegal (bouncing) changes; only a full
//! detent produces an intent.  Off the Pi this is an empty producer.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tuner_proto::config::InputConfig;
use tuner_proto::error::RadioError;
use tuner_proto::platform;
use tuner_proto::protocol::Intent;

use crate::core::ControllerHandle;

const SYSFS_GPIO: &str = "/sys/class/gpio";
const SOC_CHIP_LABELS: &[&str] = &["pinctrl-bcm2835", "pinctrl-bcm2711", "pinctrl-rp1"];

/// Indexed by `old << 2 | new` over the 2-bit `clk:dt` state.
/// 0 marks both "no change" and illegal double-edge jumps.
const TRANSITIONS: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];
const REST: u8 = 0b11;

pub trait PinSource: Send + 'static {
    /// Logic level of a BCM pin.
    fn read(&mut self, pin: u32) -> io::Result<bool>;
}

/// GPIO through the legacy sysfs interface.  BCM numbers are offset by the
/// SoC gpiochip's base, which is non-zero on recent kernels.
pub struct SysfsPins {
    values: HashMap<u32, File>,
}

impl SysfsPins {
    pub fn open(pins: &[u32]) -> io::Result<Self> {
        Self::open_at(Path::new(SYSFS_GPIO), pins)
    }

    fn open_at(root: &Path, pins: &[u32]) -> io::Result<Self> {
        let base = soc_gpio_base(root)?;
        let mut values = HashMap::new();
        for &pin in pins {
            let global = base + pin;
            let dir = root.join(format!("gpio{}", global));
            if !dir.exists() {
                fs::write(root.join("export"), global.to_string())?;
            }
            // Exported pins can take a moment to become writable.
            let mut attempts = 0;
            loop {
                match fs::write(dir.join("direction"), "in") {
                    Ok(()) => break,
                    Err(e) if attempts < 20 => {
                        attempts += 1;
                        debug!("input: gpio{} not ready ({}), retrying", global, e);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => return Err(e),
                }
            }
            values.insert(pin, File::open(dir.join("value"))?);
        }
        Ok(Self { values })
    }
}

impl PinSource for SysfsPins {
    fn read(&mut self, pin: u32) -> io::Result<bool> {
        let file = self
            .values
            .get_mut(&pin)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("pin {}", pin)))?;
        let mut buf = [0u8; 1];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        Ok(buf[0] == b'1')
    }
}

fn soc_gpio_base(root: &Path) -> io::Result<u32> {
    let mut chips: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("gpiochip"))
                .unwrap_or(false)
        })
        .collect();
    chips.sort();
    for chip in &chips {
        let label = fs::read_to_string(chip.join("label")).unwrap_or_default();
        if SOC_CHIP_LABELS.contains(&label.trim()) {
            let base = fs::read_to_string(chip.join("base"))?;
            return base
                .trim()
                .parse()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
    }
    Ok(0)
}

/// Turns successive `clk`/`dt` samples into whole detent steps.
#[derive(Debug, Clone)]
pub struct QuadratureDecoder {
    state: u8,
    accum: i8,
    steps_per_detent: i8,
}

impl QuadratureDecoder {
    pub fn new(steps_per_detent: u8) -> Self {
        Self {
            state: REST,
            accum: 0,
            steps_per_detent: steps_per_detent.clamp(1, 4) as i8,
        }
    }

    /// Feed one sample; returns `Some(±1)` when a detent completes.
    pub fn update(&mut self, clk: bool, dt: bool) -> Option<i8> {
        let next = (clk as u8) << 1 | dt as u8;
        if next == self.state {
            return None;
        }
        let delta = TRANSITIONS[(self.state << 2 | next) as usize];
        self.state = next;
        if delta == 0 {
            return None;
        }
        self.accum += delta;
        if self.accum.abs() >= self.steps_per_detent {
            let step = self.accum.signum();
            self.accum = 0;
            return Some(step);
        }
        if next == REST {
            self.accum = 0;
        }
        None
    }
}

/// Active-low push button with a minimum stable time.
#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    stable: bool,
    candidate: bool,
    since: Option<Instant>,
    hold: Duration,
}

impl ButtonDebouncer {
    pub fn new(hold: Duration) -> Self {
        Self {
            stable: false,
            candidate: false,
            since: None,
            hold,
        }
    }

    /// Feed the raw line level; true exactly once per debounced press.
    pub fn update(&mut self, level: bool, now: Instant) -> bool {
        let pressed = !level;
        if pressed != self.candidate || self.since.is_none() {
            self.candidate = pressed;
            self.since = Some(now);
        }
        let held = self
            .since
            .map(|t| now.duration_since(t) >= self.hold)
            .unwrap_or(false);
        if self.candidate != self.stable && held {
            self.stable = self.candidate;
            return self.stable;
        }
        false
    }
}

pub struct InputDebouncer<S> {
    pins: S,
    config: InputConfig,
    station: QuadratureDecoder,
    volume: QuadratureDecoder,
    station_button: ButtonDebouncer,
    volume_button: ButtonDebouncer,
    last_station_step: Option<Instant>,
}

impl<S: PinSource> InputDebouncer<S> {
    pub fn new(pins: S, config: InputConfig) -> Self {
        let hold = Duration::from_millis(config.button_debounce_ms);
        Self {
            pins,
            station: QuadratureDecoder::new(config.steps_per_detent),
            volume: QuadratureDecoder::new(config.steps_per_detent),
            station_button: ButtonDebouncer::new(hold),
            volume_button: ButtonDebouncer::new(hold),
            last_station_step: None,
            config,
        }
    }

    /// Sample every line once and return the intents that fell out.
    pub fn poll(&mut self, now: Instant) -> io::Result<Vec<Intent>> {
        let station = self.config.station;
        let volume = self.config.volume;
        let mut intents = Vec::new();

        let (clk, dt) = (self.pins.read(station.clk)?, self.pins.read(station.dt)?);
        if let Some(direction) = self.station.update(clk, dt) {
            let cooldown = Duration::from_millis(self.config.station_cooldown_ms);
            let cooling = self
                .last_station_step
                .map(|t| now.duration_since(t) < cooldown)
                .unwrap_or(false);
            if cooling {
                debug!("input: station step dropped (cooldown)");
            } else {
                self.last_station_step = Some(now);
                intents.push(Intent::RotateStation { direction });
            }
        }

        let (clk, dt) = (self.pins.read(volume.clk)?, self.pins.read(volume.dt)?);
        if let Some(direction) = self.volume.update(clk, dt) {
            intents.push(Intent::NudgeVolume {
                delta: direction as i64 * self.config.volume_step,
            });
        }

        if self.station_button.update(self.pins.read(station.sw)?, now) {
            debug!("input: station button pressed (no action)");
        }
        if self.volume_button.update(self.pins.read(volume.sw)?, now) {
            intents.push(Intent::NextPack);
        }
        Ok(intents)
    }
}

/// Start the polling thread, or nothing when input is disabled or there is
/// no GPIO hardware.
pub fn spawn(
    config: InputConfig,
    handle: ControllerHandle,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        info!("input: disabled in config");
        return None;
    }
    if !platform::is_raspberry_pi() {
        info!("input: not a Raspberry Pi, encoders disabled");
        return None;
    }
    let pins = [
        config.station.clk,
        config.station.dt,
        config.station.sw,
        config.volume.clk,
        config.volume.dt,
        config.volume.sw,
    ];
    let source = match SysfsPins::open(&pins) {
        Ok(source) => source,
        Err(e) => {
            warn!("input: GPIO unavailable: {}", e);
            return None;
        }
    };
    info!(
        "input: station CLK={} DT={} SW={}, volume CLK={} DT={} SW={}",
        config.station.clk,
        config.station.dt,
        config.station.sw,
        config.volume.clk,
        config.volume.dt,
        config.volume.sw
    );
    let interval = Duration::from_micros(config.poll_interval_us.max(100));
    let debouncer = InputDebouncer::new(source, config);
    Some(tokio::task::spawn_blocking(move || {
        poll_loop(debouncer, handle, interval, shutdown)
    }))
}

fn poll_loop<S: PinSource>(
    mut debouncer: InputDebouncer<S>,
    handle: ControllerHandle,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut failing = false;
    while !shutdown.is_cancelled() {
        match debouncer.poll(Instant::now()) {
            Ok(intents) => {
                failing = false;
                for intent in intents {
                    debug!("input: {:?}", intent);
                    if let Err(RadioError::Unavailable) = handle.blocking_enqueue(intent) {
                        return;
                    }
                }
                std::thread::sleep(interval);
            }
            Err(e) => {
                if !failing {
                    warn!("input: GPIO read failed: {}", e);
                    failing = true;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
    debug!("input: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuner_proto::config::EncoderPins;

    /// Scripted pin levels; unset pins read high (pull-up idle).
    #[derive(Default)]
    struct VirtualPins {
        levels: HashMap<u32, bool>,
    }

    impl VirtualPins {
        fn set(&mut self, pin: u32, level: bool) {
            self.levels.insert(pin, level);
        }
    }

    impl PinSource for VirtualPins {
        fn read(&mut self, pin: u32) -> io::Result<bool> {
            Ok(*self.levels.get(&pin).unwrap_or(&true))
        }
    }

    const CW: [(bool, bool); 4] = [(false, true), (false, false), (true, false), (true, true)];
    const CCW: [(bool, bool); 4] = [(true, false), (false, false), (false, true), (true, true)];

    fn feed(decoder: &mut QuadratureDecoder, seq: &[(bool, bool)]) -> Vec<i8> {
        seq.iter().filter_map(|&(c, d)| decoder.update(c, d)).collect()
    }

    #[test]
    fn test_full_detent_emits_one_step() {
        let mut d = QuadratureDecoder::new(4);
        assert_eq!(feed(&mut d, &CW), vec![1]);
        assert_eq!(feed(&mut d, &CCW), vec![-1]);
        assert_eq!(feed(&mut d, &[CW, CW].concat()), vec![1, 1]);
    }

    #[test]
    fn test_bounce_is_discarded() {
        let mut d = QuadratureDecoder::new(4);
        // Contact chatter on the first edge, then back to rest.
        let chatter = [(false, true), (true, true), (false, true), (true, true)];
        assert!(feed(&mut d, &chatter).is_empty());
        // Illegal jump straight across the cycle.
        assert!(feed(&mut d, &[(false, false), (true, true)]).is_empty());
        assert_eq!(feed(&mut d, &CW), vec![1]);
    }

    #[test]
    fn test_half_step_encoder() {
        let mut d = QuadratureDecoder::new(2);
        assert_eq!(feed(&mut d, &CW), vec![1, 1]);
    }

    #[test]
    fn test_button_needs_stable_hold() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;
        let mut b = ButtonDebouncer::new(ms(50));
        assert!(!b.update(true, t0));
        assert!(!b.update(false, t0 + ms(1)));
        assert!(!b.update(true, t0 + ms(5)));
        assert!(!b.update(false, t0 + ms(10)));
        assert!(!b.update(false, t0 + ms(40)));
        assert!(b.update(false, t0 + ms(61)));
        // Held: no repeat.
        assert!(!b.update(false, t0 + ms(500)));
        assert!(!b.update(true, t0 + ms(600)));
        assert!(!b.update(true, t0 + ms(700)));
        assert!(!b.update(false, t0 + ms(710)));
        assert!(b.update(false, t0 + ms(770)));
    }

    fn config() -> InputConfig {
        InputConfig {
            button_debounce_ms: 0,
            station: EncoderPins { clk: 1, dt: 2, sw: 3 },
            volume: EncoderPins { clk: 4, dt: 5, sw: 6 },
            volume_step: 2,
            ..InputConfig::default()
        }
    }

    fn turn(
        input: &mut InputDebouncer<VirtualPins>,
        pins: EncoderPins,
        seq: &[(bool, bool)],
        now: Instant,
    ) -> Vec<Intent> {
        let mut out = Vec::new();
        for &(clk, dt) in seq {
            input.pins.set(pins.clk, clk);
            input.pins.set(pins.dt, dt);
            out.extend(input.poll(now).unwrap());
        }
        out
    }

    #[test]
    fn test_encoders_map_to_intents() {
        let cfg = config();
        let mut input = InputDebouncer::new(VirtualPins::default(), cfg.clone());
        let now = Instant::now();
        assert_eq!(
            turn(&mut input, cfg.station, &CW, now),
            vec![Intent::RotateStation { direction: 1 }]
        );
        assert_eq!(
            turn(&mut input, cfg.volume, &CCW, now),
            vec![Intent::NudgeVolume { delta: -2 }]
        );
    }

    #[test]
    fn test_buttons() {
        let cfg = config();
        let mut input = InputDebouncer::new(VirtualPins::default(), cfg.clone());
        let now = Instant::now();
        assert!(input.poll(now).unwrap().is_empty());

        input.pins.set(cfg.station.sw, false);
        assert!(input.poll(now).unwrap().is_empty());

        input.pins.set(cfg.volume.sw, false);
        assert_eq!(input.poll(now).unwrap(), vec![Intent::NextPack]);
        assert!(input.poll(now).unwrap().is_empty());
    }

    #[test]
    fn test_station_cooldown() {
        let cfg = config();
        assert_eq!(cfg.station_cooldown_ms, 750);
        let mut input = InputDebouncer::new(VirtualPins::default(), cfg.clone());
        let t0 = Instant::now();
        assert_eq!(turn(&mut input, cfg.station, &CW, t0).len(), 1);
        let ms = Duration::from_millis;
        assert!(turn(&mut input, cfg.station, &CW, t0 + ms(100)).is_empty());
        assert_eq!(turn(&mut input, cfg.station, &CW, t0 + ms(800)).len(), 1);
    }

    #[test]
    fn test_sysfs_pins_with_chip_base() {
        let root = tempfile::tempdir().unwrap();
        let chip = root.path().join("gpiochip512");
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("label"), "pinctrl-bcm2711\n").unwrap();
        fs::write(chip.join("base"), "512\n").unwrap();
        // Pre-exported pin: sysfs would create this on export.
        let pin = root.path().join("gpio529");
        fs::create_dir_all(&pin).unwrap();
        fs::write(pin.join("direction"), "out").unwrap();
        fs::write(pin.join("value"), "0\n").unwrap();

        let mut pins = SysfsPins::open_at(root.path(), &[17]).unwrap();
        assert!(!pins.read(17).unwrap());
        fs::write(pin.join("value"), "1\n").unwrap();
        assert!(pins.read(17).unwrap());
        assert_eq!(fs::read_to_string(pin.join("direction")).unwrap(), "in");
        assert!(pins.read(4).is_err());
    }
}
