// Fixup application naturally accumulates parameters (addresses, addends,
// indices, flags). Refactoring every one into a struct would add boilerplate
// without improving clarity.
#![allow(clippy::too_many_arguments)]

pub mod diag;
pub mod driver;
pub mod elf;
pub mod gc;
pub mod icf;
pub mod input;
pub mod output;
pub mod resolve;
pub mod sections;
pub mod target;

/// Entry point for the linker binary. Spawns the link on a thread with a
/// large stack so pathological input graphs don't overflow, and maps errors
/// to a single-line diagnostic plus a non-zero exit.
pub fn linker_main() {
    const STACK_SIZE: usize = 64 * 1024 * 1024; // 64 MB
    let builder = std::thread::Builder::new().stack_size(STACK_SIZE);
    let handler = builder
        .spawn(|| {
            let args: Vec<String> = std::env::args().skip(1).collect();
            let config = driver::cli::parse_args(&args)?;
            if config.nodes.is_empty() {
                return Err("no input files".to_string());
            }
            driver::driver::Driver::new(config).run()
        })
        .expect("failed to spawn main thread");

    match handler.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            eprintln!("rld: error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            if let Some(s) = e.downcast_ref::<&str>() {
                eprintln!("rld: internal error: {}", s);
            } else if let Some(s) = e.downcast_ref::<String>() {
                eprintln!("rld: internal error: {}", s);
            } else {
                eprintln!("rld: internal error (thread panicked)");
            }
            std::process::exit(1);
        }
    }
}
