#![cfg(not(target_arch = "wasm32"))]

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;
use std::sync::Arc;

use log::{error, info, LevelFilter};

use vdnn_runtime::accel::sim::SimAccelerator;
use vdnn_runtime::config::{LayerSpec, NetworkConfig, PlannerPolicy};
use vdnn_runtime::registry::LayerKind;
use vdnn_runtime::{Accelerator, StepOutcome, TrainingRuntime};

// High-performance allocator: mirrors the rest of the crate's preference
// for crates the corpus already reaches for over a hand-rolled allocator.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    setup_os_optimizations();
    setup_cpu_math();
    setup_diagnostics();

    info!("Starting vdnn-demo...");

    if let Err(e) = std::panic::catch_unwind(run_demo) {
        error!("Demo run terminated abruptly: {e:?}");
        std::process::exit(1);
    }
}

/// Builds a toy 4-layer classifier, runs a handful of training steps
/// through a [`SimAccelerator`], and logs the plan `choose_plan` settled on.
fn run_demo() {
    let config = NetworkConfig {
        layers: vec![
            LayerSpec { kind: LayerKind::Convolution, input_shape: (16, 3, 32, 32), output_shape: (16, 32, 32, 32), fused_activation: None },
            LayerSpec { kind: LayerKind::Activation, input_shape: (16, 32, 32, 32), output_shape: (16, 32, 32, 32), fused_activation: None },
            LayerSpec { kind: LayerKind::Convolution, input_shape: (16, 32, 32, 32), output_shape: (16, 64, 32, 32), fused_activation: None },
            LayerSpec { kind: LayerKind::Activation, input_shape: (16, 64, 32, 32), output_shape: (16, 64, 32, 32), fused_activation: None },
            LayerSpec { kind: LayerKind::Softmax, input_shape: (16, 64, 32, 32), output_shape: (16, 64, 32, 32), fused_activation: None },
        ],
        planner_policy: PlannerPolicy::Dynamic,
        device_memory_bytes: 48 * 1024 * 1024,
        ..NetworkConfig::default()
    };

    let accel: Arc<dyn Accelerator> = Arc::new(SimAccelerator::new());
    let mut runtime = match TrainingRuntime::new(&config, accel) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to build training runtime: {e}");
            return;
        }
    };
    info!("plan: {}", runtime.plan().describe());

    let batch = config.batch_size as usize;
    let input_bytes = vec![0u8; config.layers[0].input_shape.0 as usize
        * config.layers[0].input_shape.1 as usize
        * config.layers[0].input_shape.2 as usize
        * config.layers[0].input_shape.3 as usize
        * 4];
    let labels: Vec<u32> = (0..batch as u32).map(|n| n % 64).collect();

    for step in 0..5 {
        match runtime.step(&input_bytes, &labels, 0.01, true) {
            Ok(StepOutcome::Loss(loss)) => info!("step {step}: loss = {loss:.4}"),
            Ok(StepOutcome::CorrectCount(_)) => unreachable!("training steps report loss"),
            Err(e) => {
                error!("step {step} failed: {e}");
                return;
            }
        }
    }

    if let Err(e) = runtime.shutdown() {
        error!("shutdown failed: {e}");
    }
}

/// Sets up high-performance OS-level constraints.
fn setup_os_optimizations() {
    #[cfg(feature = "high_priority")]
    {
        let _ = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max);
        info!("Elevated main thread priority to Max.");
    }

    // Windows high-resolution timer fix, kept for parity with the host
    // platform the demo might run on; no-op elsewhere.
    #[cfg(target_os = "windows")]
    unsafe {
        // windows_sys::Win32::Media::timeBeginPeriod(1);
    }
}

/// Flush-to-zero / denormals-are-zero: the suballocator's byte-counting
/// arithmetic doesn't need this, but the host-side softmax/cross-entropy
/// math in `lib.rs` runs on every step and can stall on denormals near a
/// converged loss.
fn setup_cpu_math() {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_MM_SET_DENORMALS_ZERO_MODE, _MM_SET_FLUSH_ZERO_MODE, _MM_DENORMALS_ZERO_ON, _MM_FLUSH_ZERO_ON};
        unsafe {
            _MM_SET_FLUSH_ZERO_MODE(_MM_FLUSH_ZERO_ON);
            _MM_SET_DENORMALS_ZERO_MODE(_MM_DENORMALS_ZERO_ON);
        }
        info!("Enabled FTZ/DAZ for CPU floating point optimizations.");
    }
}

/// Sets up logging and a crash-dumping panic hook.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) { LevelFilter::Debug } else { LevelFilter::Warn })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };

        let location = panic_info
            .location()
            .map_or("Unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        let crash_msg = format!("=== RUNTIME CRASH ===\nReason: {msg}\nLocation: {location}\n\nStack Trace:\n{backtrace}");

        eprintln!("\x1b[31;1m{crash_msg}\x1b[0m");

        if let Ok(mut file) = File::create("vdnn_crash.log") {
            let _ = file.write_all(crash_msg.as_bytes());
            eprintln!("Crash report saved to vdnn_crash.log");
        }
    }));
}
