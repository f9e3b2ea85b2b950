use std::time::Duration;

use cadenza::nodes::{FaderNode, FaderParams, OscillatorNode, OscillatorParams, Waveform};
use cadenza::{CpalConfig, CpalEngineCtx, EngineConfig};

const BEEP_FREQUENCY_HZ: f64 = 440.0;
const BEEP_AMPLITUDE: f64 = 0.4;
const BEEP_DURATION: Duration = Duration::from_secs(4);

fn main() {
    simple_log::quick!("info");

    println!("Cadenza beep test...");

    let mut ctx = CpalEngineCtx::new(EngineConfig {
        master_gain: 0.8,
        ..Default::default()
    });
    ctx.install_panic_handler();

    let osc_params = OscillatorParams::new(Waveform::Sine, BEEP_FREQUENCY_HZ, 0.0, BEEP_AMPLITUDE);
    let fader_params = FaderParams::new(0.0, 1.0);

    let osc = ctx
        .add_processor(Box::new(OscillatorNode::new(osc_params.clone())))
        .unwrap();
    let fader = ctx
        .add_processor(Box::new(FaderNode::new(fader_params.clone())))
        .unwrap();

    ctx.route(osc, fader, true).unwrap();
    ctx.add_source(osc).unwrap();

    ctx.start_stream(CpalConfig::default()).unwrap();

    // Sweep the beep across the stereo field while it plays.
    let steps = 40;
    for i in 0..steps {
        let pan = -1.0 + 2.0 * i as f32 / (steps - 1) as f32;
        fader_params.set_pan(pan);
        std::thread::sleep(BEEP_DURATION / steps);

        if let Some(Err(e)) = ctx.poll_backend() {
            log::error!("stream died: {e}");
            break;
        }
    }

    ctx.stop_stream().unwrap();
}
