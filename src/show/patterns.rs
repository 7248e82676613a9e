//! Built-in pattern generators and the show registry
//!
//! A generator maps `(x, y, t)` to a color. It keeps no state between calls;
//! anything it branches on comes from the [`PatternContext`], which carries the
//! panel size and the shared [`ConversationSignals`].

use std::collections::BTreeMap;
use std::f32::consts::{PI, TAU};
use std::sync::Arc;

use super::grid::Rgb;
use crate::state::{ConversationSignals, Persona};
use crate::{Error, Result};

/// Read-only inputs available to every generator call
#[derive(Debug, Clone, Copy)]
pub struct PatternContext<'a> {
    /// Panel width in pixels
    pub width: usize,
    /// Panel height in pixels
    pub height: usize,
    /// Shared conversation state
    pub signals: &'a ConversationSignals,
}

/// A pure `(x, y, t) -> color` mapping
pub type PatternFn = Arc<dyn Fn(usize, usize, u64, &PatternContext<'_>) -> Rgb + Send + Sync>;

/// Name → generator lookup with unique keys
#[derive(Clone, Default)]
pub struct ShowRegistry {
    shows: BTreeMap<String, PatternFn>,
}

impl std::fmt::Debug for ShowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShowRegistry")
            .field("shows", &self.shows.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ShowRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in show
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, generator) in builtins() {
            registry.shows.insert(name.to_string(), generator);
        }
        registry
    }

    /// Add a generator under a new name
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty or already registered
    pub fn register<F>(&mut self, name: impl Into<String>, generator: F) -> Result<()>
    where
        F: Fn(usize, usize, u64, &PatternContext<'_>) -> Rgb + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Config("show name must not be empty".to_string()));
        }
        if self.shows.contains_key(&name) {
            return Err(Error::Config(format!("show already registered: {name}")));
        }
        self.shows.insert(name, Arc::new(generator));
        Ok(())
    }

    /// Look up a generator
    #[must_use]
    pub fn get(&self, name: &str) -> Option<PatternFn> {
        self.shows.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.shows.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shows.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shows.is_empty()
    }
}

fn builtins() -> Vec<(&'static str, PatternFn)> {
    vec![
        ("rainbow", Arc::new(rainbow) as PatternFn),
        ("two-axis", Arc::new(two_axis) as PatternFn),
        ("breathe", Arc::new(breathe) as PatternFn),
        ("listen", Arc::new(listen) as PatternFn),
        ("think", Arc::new(think) as PatternFn),
        ("speak", Arc::new(speak) as PatternFn),
        ("ember", Arc::new(ember) as PatternFn),
        ("off", Arc::new(off) as PatternFn),
    ]
}

/// Map a value in `[-1, 1]` onto `[0, 255]`
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn wave(v: f32) -> u8 {
    (255.0 * (v.clamp(-1.0, 1.0) + 1.0) / 2.0) as u8
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unit(v: f32) -> u8 {
    (255.0 * v.clamp(0.0, 1.0)) as u8
}

#[allow(clippy::cast_precision_loss)]
fn f(v: usize) -> f32 {
    v as f32
}

#[allow(clippy::cast_precision_loss)]
fn ft(t: u64) -> f32 {
    // Wrap so long uptimes keep f32 precision
    (t % 1_000_000) as f32
}

/// Base and accent colors for a persona
const fn palette(persona: Persona) -> (Rgb, Rgb) {
    match persona {
        Persona::Benevolent => (Rgb::new(0, 140, 160), Rgb::new(120, 255, 200)),
        Persona::Evil => (Rgb::new(150, 0, 20), Rgb::new(255, 60, 0)),
    }
}

/// Phase-shifted sine waves on each channel
pub fn rainbow(x: usize, y: usize, t: u64, _ctx: &PatternContext<'_>) -> Rgb {
    let t = ft(t) / 10.0;
    let (x, y) = (f(x) / 2.0, f(y) / 2.0);
    Rgb::new(
        wave((t + x).sin()),
        wave((t + y).sin()),
        wave((t + x + y).sin()),
    )
}

/// Red across columns, green down rows, blue cycling with time
#[allow(clippy::cast_possible_truncation)]
pub fn two_axis(x: usize, y: usize, t: u64, ctx: &PatternContext<'_>) -> Rgb {
    Rgb::new(
        unit(f(x) / f(ctx.width)),
        unit(f(y) / f(ctx.height)),
        (t.wrapping_mul(5) % 255) as u8,
    )
}

/// Slow whole-panel breathing in the persona's palette
pub fn breathe(_x: usize, _y: usize, t: u64, ctx: &PatternContext<'_>) -> Rgb {
    let (base, accent) = palette(ctx.signals.active_persona());
    let level = (ft(t) * TAU / 90.0).sin().mul_add(0.5, 0.5);
    base.lerp(accent, level).scaled(unit(level.mul_add(0.7, 0.3)))
}

/// Bright bar sweeping back and forth across columns
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn listen(x: usize, _y: usize, t: u64, ctx: &PatternContext<'_>) -> Rgb {
    let (base, accent) = palette(ctx.signals.active_persona());
    let span = ctx.width.max(2) - 1;
    let period = (span * 2) as u64;
    let step = (t / 2 % period) as usize;
    let head = if step <= span { step } else { period as usize - step };
    let distance = head.abs_diff(x);
    let glow = 1.0 - (f(distance) / 3.0).min(1.0);
    base.scaled(40).lerp(accent, glow)
}

/// Comet orbiting the panel center
pub fn think(x: usize, y: usize, t: u64, ctx: &PatternContext<'_>) -> Rgb {
    let (base, accent) = palette(ctx.signals.active_persona());
    let cx = f(ctx.width - 1) / 2.0;
    let cy = f(ctx.height - 1) / 2.0;
    let angle = (f(y) - cy).atan2(f(x) - cx);
    let head = (ft(t) * TAU / 30.0) % TAU - PI;
    let mut behind = head - angle;
    if behind < 0.0 {
        behind += TAU;
    }
    let tail = 1.0 - (behind / PI).min(1.0);
    base.scaled(20).lerp(accent, tail * tail)
}

/// Rings rippling out from the center while audio plays
pub fn speak(x: usize, y: usize, t: u64, ctx: &PatternContext<'_>) -> Rgb {
    let (base, accent) = palette(ctx.signals.active_persona());
    let cx = f(ctx.width - 1) / 2.0;
    let cy = f(ctx.height - 1) / 2.0;
    let r = (f(x) - cx).hypot(f(y) - cy);
    let ripple = r.mul_add(1.2, -ft(t) * 0.6).cos().mul_add(0.5, 0.5);
    let level = if ctx.signals.is_speaking() { ripple } else { ripple * 0.3 };
    base.scaled(60).lerp(accent, level)
}

/// Deterministic flickering fire, hotter at the bottom
#[allow(clippy::cast_possible_truncation)]
pub fn ember(x: usize, y: usize, t: u64, ctx: &PatternContext<'_>) -> Rgb {
    let frame = t / 3;
    let noise = hash3(x as u64, y as u64, frame);
    let heat = f(y + 1) / f(ctx.height);
    let flicker = f32::from((noise & 0xff) as u8) / 255.0;
    let level = heat.mul_add(0.7, flicker * 0.3);
    let (base, accent) = palette(Persona::Evil);
    Rgb::BLACK.lerp(base, level * 1.5).lerp(accent, (level - 0.6).max(0.0) * 2.0)
}

/// All pixels dark
pub const fn off(_x: usize, _y: usize, _t: u64, _ctx: &PatternContext<'_>) -> Rgb {
    Rgb::BLACK
}

/// Small integer hash, stable across runs
const fn hash3(a: u64, b: u64, c: u64) -> u64 {
    let mut h = a
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(b.wrapping_mul(0xC2B2_AE3D_27D4_EB4F))
        .wrapping_add(c.wrapping_mul(0x1656_67B1_9E37_79F9));
    h ^= h >> 29;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^ (h >> 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(signals: &ConversationSignals) -> PatternContext<'_> {
        PatternContext {
            width: 10,
            height: 10,
            signals,
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ShowRegistry::with_builtins();
        for name in ["rainbow", "two-axis", "breathe", "listen", "think", "speak", "ember", "off"] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ShowRegistry::with_builtins();
        let err = registry.register("rainbow", |_, _, _, _| Rgb::BLACK);
        assert!(matches!(err, Err(Error::Config(_))));
        assert!(registry.register("  ", |_, _, _, _| Rgb::BLACK).is_err());
        assert!(registry.register("custom", |_, _, _, _| Rgb::WHITE).is_ok());
        assert!(registry.contains("custom"));
    }

    #[test]
    fn test_rainbow_origin() {
        let signals = ConversationSignals::new();
        // sin(0) = 0 maps to mid-scale on every channel
        assert_eq!(rainbow(0, 0, 0, &ctx(&signals)), Rgb::new(127, 127, 127));
    }

    #[test]
    fn test_two_axis_gradient() {
        let signals = ConversationSignals::new();
        let c = ctx(&signals);
        assert_eq!(two_axis(0, 0, 0, &c), Rgb::new(0, 0, 0));
        assert_eq!(two_axis(5, 0, 3, &c), Rgb::new(127, 0, 15));
        assert_eq!(two_axis(0, 0, 51, &c).b, 0);
    }

    #[test]
    fn test_generators_are_deterministic() {
        let signals = ConversationSignals::new();
        let c = ctx(&signals);
        let registry = ShowRegistry::with_builtins();
        for name in registry.names() {
            let g = registry.get(name).unwrap();
            for t in [0, 1, 17, 999] {
                assert_eq!(g(3, 4, t, &c), g(3, 4, t, &c), "{name} at t={t}");
            }
        }
    }

    #[test]
    fn test_persona_recolors_breathe() {
        let signals = ConversationSignals::new();
        let good = breathe(0, 0, 20, &ctx(&signals));
        signals.set_active_persona(Persona::Evil);
        let evil = breathe(0, 0, 20, &ctx(&signals));
        assert_ne!(good, evil);
        assert!(evil.r > evil.b);
    }

    #[test]
    fn test_single_pixel_panel_does_not_panic() {
        let signals = ConversationSignals::new();
        let c = PatternContext {
            width: 1,
            height: 1,
            signals: &signals,
        };
        let registry = ShowRegistry::with_builtins();
        for name in registry.names() {
            let g = registry.get(name).unwrap();
            let _ = g(0, 0, 12, &c);
        }
    }
}
