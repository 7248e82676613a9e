//! Show rendering: pixel grid, pattern library, and the fixed-rate engine

mod engine;
mod grid;
pub mod patterns;

pub use engine::{EngineConfig, FrameObserver, MAX_FPS, ObserverId, ShowEngine, render_frame};
pub use grid::{Frame, PixelGrid, Rgb};
pub use patterns::{PatternContext, PatternFn, ShowRegistry};
