//! Hysteretic heating/cooling/fan decisions.
//!
//! [`control`] is evaluated against a [`Controller`], which owns the current
//! [`ControlState`] and performs the actuation. The controller's state only
//! changes through [`control`].

use chrono::{DateTime, Duration, Utc};
use embedded_hal::digital::OutputPin;
use log::{error, info};

use crate::model::{ControlState, Mode, Reading, Settings};

/// Minutes without motion before the room counts as unoccupied.
pub const VACANCY_AFTER_MINUTES: i64 = 30;

/// Band widening applied while the room is unoccupied.
pub const VACANCY_OFFSET: f32 = 2.0;

/// Overshoot required past a bound before an active heat/cool run stops.
pub const HYSTERESIS: f32 = 1.5;

pub trait Controller {
    fn heat(&mut self);
    fn cool(&mut self);
    fn fan(&mut self);
    fn off(&mut self);
    fn state(&self) -> ControlState;
}

impl<C: Controller + ?Sized> Controller for Box<C> {
    fn heat(&mut self) {
        (**self).heat();
    }
    fn cool(&mut self) {
        (**self).cool();
    }
    fn fan(&mut self) {
        (**self).fan();
    }
    fn off(&mut self) {
        (**self).off();
    }
    fn state(&self) -> ControlState {
        (**self).state()
    }
}

/// Runs one evaluation and returns the temperature being driven toward.
///
/// Evaluation order is fixed: `Off` mode wins outright, then the cooling
/// bound, then the heating bound, then the in-band case. A repeated
/// evaluation with the same inputs never actuates twice.
pub fn control<C: Controller + ?Sized>(
    controller: &mut C,
    settings: &Settings,
    last_motion: DateTime<Utc>,
    reading: &Reading,
) -> Option<f32> {
    let state = controller.state();

    if settings.mode == Mode::Off {
        if state != ControlState::Idle {
            controller.off();
        }
        return None;
    }

    let vacancy = if reading.time - last_motion > Duration::minutes(VACANCY_AFTER_MINUTES) {
        VACANCY_OFFSET
    } else {
        0.0
    };
    let mut offset = vacancy;
    if matches!(state, ControlState::Heating | ControlState::Cooling) {
        offset -= HYSTERESIS;
    }

    let high = settings.high + offset;
    let low = settings.low - offset;

    if reading.temp > high {
        if state != ControlState::Cooling {
            controller.cool();
        }
    } else if reading.temp < low {
        if state != ControlState::Heating {
            controller.heat();
        }
    } else {
        match settings.mode {
            Mode::Fan => {
                if state != ControlState::Fanning {
                    controller.fan();
                }
            }
            _ => {
                if state != ControlState::Idle {
                    controller.off();
                }
            }
        }
    }

    match controller.state() {
        ControlState::Cooling => Some(settings.high + vacancy),
        ControlState::Heating => Some(settings.low - vacancy),
        ControlState::Idle | ControlState::Fanning => None,
    }
}

/// Stand-in used when no relays are wired up. Only tracks state.
#[derive(Debug, Default)]
pub struct NoopController {
    state: ControlState,
}

impl Controller for NoopController {
    fn heat(&mut self) {
        info!("(noop) heat");
        self.state = ControlState::Heating;
    }
    fn cool(&mut self) {
        info!("(noop) cool");
        self.state = ControlState::Cooling;
    }
    fn fan(&mut self) {
        info!("(noop) fan");
        self.state = ControlState::Fanning;
    }
    fn off(&mut self) {
        info!("(noop) off");
        self.state = ControlState::Idle;
    }
    fn state(&self) -> ControlState {
        self.state
    }
}

/// Drives three active-high relay lines: heat, cool and fan.
///
/// Heating and cooling also run the fan. A pin write failure is logged and
/// the state still advances, so the next evaluation does not hammer a dead
/// line.
pub struct RelayController<P> {
    heat: P,
    cool: P,
    fan: P,
    state: ControlState,
}

impl<P: OutputPin> RelayController<P> {
    /// Starts with every relay released.
    pub fn new(heat: P, cool: P, fan: P) -> Self {
        let mut controller = RelayController {
            heat,
            cool,
            fan,
            state: ControlState::Idle,
        };
        controller.drive(false, false, false);
        controller
    }

    fn drive(&mut self, heat: bool, cool: bool, fan: bool) {
        for (name, pin, on) in [
            ("heat", &mut self.heat, heat),
            ("cool", &mut self.cool, cool),
            ("fan", &mut self.fan, fan),
        ] {
            let result = if on { pin.set_high() } else { pin.set_low() };
            if let Err(err) = result {
                error!("Error driving {} relay: {:?}", name, err);
            }
        }
    }
}

impl<P: OutputPin> Controller for RelayController<P> {
    fn heat(&mut self) {
        info!("Heating on");
        self.drive(true, false, true);
        self.state = ControlState::Heating;
    }
    fn cool(&mut self) {
        info!("Cooling on");
        self.drive(false, true, true);
        self.state = ControlState::Cooling;
    }
    fn fan(&mut self) {
        info!("Fan only");
        self.drive(false, false, true);
        self.state = ControlState::Fanning;
    }
    fn off(&mut self) {
        info!("All relays off");
        self.drive(false, false, false);
        self.state = ControlState::Idle;
    }
    fn state(&self) -> ControlState {
        self.state
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gpio::tests::MockPin;
    use proptest::prelude::*;

    /// Records every actuation so tests can count them.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingController {
        pub state: ControlState,
        pub calls: Vec<&'static str>,
    }

    impl RecordingController {
        pub fn in_state(state: ControlState) -> Self {
            RecordingController {
                state,
                calls: Vec::new(),
            }
        }
    }

    impl Controller for RecordingController {
        fn heat(&mut self) {
            self.calls.push("heat");
            self.state = ControlState::Heating;
        }
        fn cool(&mut self) {
            self.calls.push("cool");
            self.state = ControlState::Cooling;
        }
        fn fan(&mut self) {
            self.calls.push("fan");
            self.state = ControlState::Fanning;
        }
        fn off(&mut self) {
            self.calls.push("off");
            self.state = ControlState::Idle;
        }
        fn state(&self) -> ControlState {
            self.state
        }
    }

    fn band(mode: Mode) -> Settings {
        Settings {
            low: 18.0,
            high: 26.0,
            mode,
        }
    }

    fn reading_at(temp: f32, time: DateTime<Utc>) -> Reading {
        Reading {
            temp,
            humidity: 40.0,
            time,
        }
    }

    #[test]
    fn test_cooling_hysteresis() {
        let now = Utc::now();
        let seen = now - Duration::minutes(5);
        let mut controller = RecordingController::default();

        let target = control(&mut controller, &band(Mode::Auto), seen, &reading_at(27.0, now));
        assert_eq!(controller.state, ControlState::Cooling);
        assert_eq!(target, Some(26.0));

        // Still above High - 1.5, keeps cooling.
        let target = control(&mut controller, &band(Mode::Auto), seen, &reading_at(24.6, now));
        assert_eq!(controller.state, ControlState::Cooling);
        assert_eq!(target, Some(26.0));

        control(&mut controller, &band(Mode::Auto), seen, &reading_at(24.4, now));
        assert_eq!(controller.state, ControlState::Idle);
        assert_eq!(controller.calls, vec!["cool", "off"]);
    }

    #[test]
    fn test_heating_hysteresis() {
        let now = Utc::now();
        let mut controller = RecordingController::default();

        let target = control(&mut controller, &band(Mode::Auto), now, &reading_at(17.0, now));
        assert_eq!(controller.state, ControlState::Heating);
        assert_eq!(target, Some(18.0));

        control(&mut controller, &band(Mode::Auto), now, &reading_at(19.4, now));
        assert_eq!(controller.state, ControlState::Heating);

        let target = control(&mut controller, &band(Mode::Auto), now, &reading_at(19.6, now));
        assert_eq!(controller.state, ControlState::Idle);
        assert_eq!(target, None);
        assert_eq!(controller.calls, vec!["heat", "off"]);
    }

    #[test]
    fn test_vacancy_widens_band() {
        let now = Utc::now();
        let away = now - Duration::minutes(31);
        let mut controller = RecordingController::default();

        control(&mut controller, &band(Mode::Auto), away, &reading_at(27.0, now));
        assert_eq!(controller.state, ControlState::Idle);
        control(&mut controller, &band(Mode::Auto), away, &reading_at(16.5, now));
        assert_eq!(controller.state, ControlState::Idle);
        assert!(controller.calls.is_empty());

        let target = control(&mut controller, &band(Mode::Auto), away, &reading_at(28.5, now));
        assert_eq!(controller.state, ControlState::Cooling);
        assert_eq!(target, Some(28.0));
    }

    #[test]
    fn test_off_mode_dominates() {
        let now = Utc::now();
        for state in [
            ControlState::Heating,
            ControlState::Cooling,
            ControlState::Fanning,
        ] {
            let mut controller = RecordingController::in_state(state);
            let target = control(&mut controller, &band(Mode::Off), now, &reading_at(40.0, now));
            assert_eq!(target, None);
            assert_eq!(controller.state, ControlState::Idle);
            assert_eq!(controller.calls, vec!["off"]);
        }

        let mut controller = RecordingController::default();
        assert_eq!(
            control(&mut controller, &band(Mode::Off), now, &reading_at(-5.0, now)),
            None
        );
        assert!(controller.calls.is_empty());
    }

    #[test]
    fn test_fan_mode_in_band() {
        let now = Utc::now();
        let mut controller = RecordingController::default();

        control(&mut controller, &band(Mode::Fan), now, &reading_at(22.0, now));
        assert_eq!(controller.state, ControlState::Fanning);
        control(&mut controller, &band(Mode::Fan), now, &reading_at(22.0, now));
        assert_eq!(controller.calls, vec!["fan"]);

        // Fan mode still conditions outside the band.
        control(&mut controller, &band(Mode::Fan), now, &reading_at(30.0, now));
        assert_eq!(controller.state, ControlState::Cooling);

        // Back in band (past the hysteresis) it falls back to the fan.
        control(&mut controller, &band(Mode::Fan), now, &reading_at(24.0, now));
        assert_eq!(controller.state, ControlState::Fanning);
        assert_eq!(controller.calls, vec!["fan", "cool", "fan"]);
    }

    #[test]
    fn test_fanning_stops_in_auto() {
        let now = Utc::now();
        let mut controller = RecordingController::in_state(ControlState::Fanning);
        control(&mut controller, &band(Mode::Auto), now, &reading_at(22.0, now));
        assert_eq!(controller.state, ControlState::Idle);
        assert_eq!(controller.calls, vec!["off"]);
    }

    #[test]
    fn test_relay_controller_drives_pins() {
        let mut relays = RelayController::new(
            MockPin::default(),
            MockPin::default(),
            MockPin::default(),
        );
        relays.heat();
        assert!(relays.heat.high && !relays.cool.high && relays.fan.high);
        relays.cool();
        assert!(!relays.heat.high && relays.cool.high && relays.fan.high);
        relays.fan();
        assert!(!relays.heat.high && !relays.cool.high && relays.fan.high);
        relays.off();
        assert!(!relays.heat.high && !relays.cool.high && !relays.fan.high);
        assert_eq!(relays.state(), ControlState::Idle);
    }

    fn arb_state() -> impl Strategy<Value = ControlState> {
        prop_oneof![
            Just(ControlState::Idle),
            Just(ControlState::Heating),
            Just(ControlState::Cooling),
            Just(ControlState::Fanning),
        ]
    }

    fn arb_mode() -> impl Strategy<Value = Mode> {
        prop_oneof![Just(Mode::Off), Just(Mode::Auto), Just(Mode::Fan)]
    }

    proptest! {
        /// The second identical evaluation never actuates.
        #[test]
        fn repeated_reading_is_idempotent(
            state in arb_state(),
            mode in arb_mode(),
            low in 10.0f32..20.0,
            width in 2.0f32..10.0,
            temp in 0.0f32..40.0,
            idle_minutes in 0i64..90,
        ) {
            let now = Utc::now();
            let settings = Settings { low, high: low + width, mode };
            let last_motion = now - Duration::minutes(idle_minutes);
            let reading = reading_at(temp, now);

            let mut controller = RecordingController::in_state(state);
            let first = control(&mut controller, &settings, last_motion, &reading);
            let after_first = controller.state;
            let calls = controller.calls.len();
            prop_assert!(calls <= 1);

            let second = control(&mut controller, &settings, last_motion, &reading);
            prop_assert_eq!(controller.state, after_first);
            prop_assert_eq!(controller.calls.len(), calls);
            prop_assert_eq!(first, second);
        }
    }
}
