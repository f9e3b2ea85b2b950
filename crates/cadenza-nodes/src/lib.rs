mod fader;
mod iir;
mod oscillator;
mod passthrough;
mod renderer;
mod wav_player;

pub use fader::{FaderNode, FaderParams};
pub use iir::{IirFilterNode, IirFilterParams};
pub use oscillator::{OscillatorNode, OscillatorParams, Waveform};
pub use passthrough::PassthroughNode;
pub use renderer::{AudioRendererNode, AudioRendererState};
pub use wav_player::{WavPlayerNode, WavPlayerState};
