//! Output chain execution
//!
//! A chain runs on its own task: entries execute strictly in order, and a
//! `Delay` entry sleeps on that task only. Each key or button output takes the
//! injector lock for its whole press/release sequence, so concurrent chains
//! can interleave between entries but never inside one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use evdev::{InputEvent, Key};
use keycap_config::{ActionKind, DelayUnit, IODefinition, IOFlag, MouseButton};

use crate::injector::{key_event, InjectError, Injector, InjectorGuard};
use crate::keymap;
use crate::matcher::ChainJob;
use crate::modifiers::{modifier_keys, vk_flag, ModifierState};

/// Identity of a toggled output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToggleKey {
    Key(u8),
    Mouse(MouseButton),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flip {
    /// Switched on; press and hold
    On,
    /// Switched off; release the modifiers held since it was switched on
    Off { modifiers: u8 },
}

/// Outputs currently toggled on, with the modifiers pressed alongside them.
#[derive(Debug, Clone, Default)]
pub struct ToggleState {
    active: Arc<Mutex<HashMap<ToggleKey, u8>>>,
}

impl ToggleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flip(&self, key: ToggleKey, modifiers: u8) -> Flip {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.remove(&key) {
            Some(modifiers) => Flip::Off { modifiers },
            None => {
                active.insert(key, modifiers);
                Flip::On
            }
        }
    }

    pub fn is_on(&self, key: ToggleKey) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Alt/Control/Shift flags held down by active toggles: the modifiers
    /// pressed with each toggled output and any toggled modifier key itself.
    pub fn held_flags(&self) -> u8 {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .fold(0, |acc, (toggle, modifiers)| {
                let own = match toggle {
                    ToggleKey::Key(vk) => vk_flag(*vk).map_or(0, IOFlag::bit),
                    ToggleKey::Mouse(_) => 0,
                };
                acc | modifiers | own
            })
    }

    /// Remove every active toggle.
    pub fn drain(&self) -> Vec<(ToggleKey, u8)> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }
}

/// Runs matched chains against the injector.
#[derive(Clone)]
pub struct ChainExecutor {
    injector: Injector,
    toggles: ToggleState,
    modifiers: ModifierState,
    delay_unit: DelayUnit,
}

impl ChainExecutor {
    pub fn new(injector: Injector, modifiers: ModifierState, delay_unit: DelayUnit) -> Self {
        Self {
            injector,
            toggles: ToggleState::new(),
            modifiers,
            delay_unit,
        }
    }

    pub fn toggles(&self) -> &ToggleState {
        &self.toggles
    }

    /// Execute one chain.
    ///
    /// A chain whose first output is `DoNothing` only swallows its trigger.
    /// Otherwise the trigger's held modifiers are released before the first
    /// output and pressed again afterwards if they are still physically held.
    pub async fn run(&self, job: ChainJob) -> Result<(), InjectError> {
        let outputs = job.pair.outputs();
        if outputs
            .first()
            .is_some_and(|output| output.action() == ActionKind::Nothing)
        {
            tracing::debug!("{} swallowed", job.pair.describe_input());
            return Ok(());
        }

        let held = job.held.keys();
        if !held.is_empty() {
            let mut guard = self.injector.lock().await;
            for modifier in &held {
                guard.emit(&[key_event(modifier.to_key(), 0)])?;
            }
        }

        for output in outputs {
            self.execute_output(output).await?;
        }

        let still_held = self.modifiers.snapshot().intersect(job.held).keys();
        if !still_held.is_empty() {
            let mut guard = self.injector.lock().await;
            for modifier in &still_held {
                guard.emit(&[key_event(modifier.to_key(), 1)])?;
            }
        }

        Ok(())
    }

    async fn execute_output(&self, output: &IODefinition) -> Result<(), InjectError> {
        match output.action() {
            ActionKind::Nothing => Ok(()),
            ActionKind::Delay(amount) => {
                tokio::time::sleep(self.delay_unit.duration(amount)).await;
                Ok(())
            }
            ActionKind::Mouse(button) => {
                self.press_output(output, ToggleKey::Mouse(button), keymap::button_key(button))
                    .await
            }
            ActionKind::Key(vk) => match keymap::to_key(vk) {
                Some(key) => self.press_output(output, ToggleKey::Key(vk), key).await,
                None => {
                    tracing::warn!("No key to inject for virtual-key 0x{:02X}, skipping", vk);
                    Ok(())
                }
            },
        }
    }

    async fn press_output(
        &self,
        output: &IODefinition,
        toggle: ToggleKey,
        key: Key,
    ) -> Result<(), InjectError> {
        let modifiers = output.modifiers();
        let mut guard = self.injector.lock().await;

        if !output.is_flagged_as(IOFlag::Toggle) {
            press(&mut guard, modifiers, key)?;
            return release(&mut guard, modifiers, key);
        }

        // Flip under the lock so the toggle state matches the emitted order
        if !guard.is_armed() {
            return Err(InjectError::Closed);
        }
        match self.toggles.flip(toggle, modifiers) {
            Flip::On => {
                tracing::debug!("Toggle on: {}", output.describe());
                press(&mut guard, modifiers, key)
            }
            Flip::Off { modifiers } => {
                tracing::debug!("Toggle off: {}", output.describe());
                release(&mut guard, modifiers, key)
            }
        }
    }

    /// Release every output still toggled on. Returns how many were released.
    pub async fn release_toggles(&self) -> Result<usize, InjectError> {
        let active = self.toggles.drain();
        if active.is_empty() {
            return Ok(0);
        }

        let mut guard = self.injector.lock().await;
        for (toggle, modifiers) in &active {
            let key = match toggle {
                ToggleKey::Mouse(button) => keymap::button_key(*button),
                ToggleKey::Key(vk) => match keymap::to_key(*vk) {
                    Some(key) => key,
                    None => continue,
                },
            };
            release(&mut guard, *modifiers, key)?;
        }

        tracing::info!("Released {} toggled output(s)", active.len());
        Ok(active.len())
    }
}

/// Modifiers in Ctrl, Alt, Shift order, then the key; one frame per event.
fn press(guard: &mut InjectorGuard<'_>, modifiers: u8, key: Key) -> Result<(), InjectError> {
    for event in press_events(modifiers, key) {
        guard.emit(&[event])?;
    }
    Ok(())
}

/// The key, then modifiers in reverse order.
fn release(guard: &mut InjectorGuard<'_>, modifiers: u8, key: Key) -> Result<(), InjectError> {
    let mut events = press_events(modifiers, key);
    events.reverse();
    for event in events {
        guard.emit(&[InputEvent::new(event.event_type(), event.code(), 0)])?;
    }
    Ok(())
}

fn press_events(modifiers: u8, key: Key) -> Vec<InputEvent> {
    modifier_keys(modifiers)
        .into_iter()
        .chain(std::iter::once(key))
        .map(|key| key_event(key, 1))
        .collect()
}
