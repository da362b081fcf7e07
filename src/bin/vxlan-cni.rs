use std::fs::OpenOptions;
use std::panic;
use std::process;
use std::sync::Arc;

use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use vxlan_cni::commands::{run_cni, CNI_VERSION};
use vxlan_cni::error::EXIT_UNEXPECTED;
use vxlan_cni::types::ErrorResult;

const LOG_FILE: &str = "/var/log/vxlan-cni.log";

// stdout belongs to the CNI result protocol, so logs go to a file, or to
// stderr when the file cannot be opened
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match OpenOptions::new().create(true).append(true).open(LOG_FILE) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

fn error_body(code: i32, msg: &str) -> String {
    let body = ErrorResult {
        cni_version: CNI_VERSION.to_string(),
        code,
        msg: msg.to_string(),
        details: String::new(),
    };
    serde_json::to_string(&body).unwrap_or_else(|_| {
        format!(r#"{{"cniVersion":"{CNI_VERSION}","code":{code},"msg":"serialization failure","details":""}}"#)
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic during execution".to_string()
    }
}

fn main() {
    init_logging();

    let (code, output) = match panic::catch_unwind(run_cni) {
        Ok(Ok(output)) => (0, output),
        Ok(Err(err)) => {
            error!(error = %err, code = err.exit_code(), "CNI invocation failed");
            (err.exit_code(), Some(error_body(err.exit_code(), &err.to_string())))
        }
        Err(payload) => {
            let msg = panic_message(payload);
            error!(msg, "unexpected fault");
            (EXIT_UNEXPECTED, Some(error_body(EXIT_UNEXPECTED, &msg)))
        }
    };

    if let Some(output) = &output {
        debug!(stdout = %output, "output");
        println!("{output}");
    }
    process::exit(code);
}
