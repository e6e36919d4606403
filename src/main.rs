//! Thin command-line driver for smoke-testing a compiled `.dxb` file.
//!
//! Not part of the library's public surface: loads a binary, runs a named
//! scene, and prints text/choices to stdout, reading a line of stdin to pick
//! a choice or advance past running text.
use std::env;
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use diannex::{decode, NullFunctionHandler, Vm, VmOptions};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = env::args().skip(1);
    let (path, scene) = match (args.next(), args.next()) {
        (Some(path), Some(scene)) => (path, scene),
        _ => {
            eprintln!("usage: diannex-run <file.dxb> <scene>");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(&path, &scene) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(path: &str, scene: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(path)?;
    let binary = decode(&bytes)?;
    let mut vm = Vm::new(
        binary,
        Box::new(NullFunctionHandler),
        VmOptions::default(),
        None,
        None,
    )?;

    vm.run_scene(scene)?;

    loop {
        vm.update()?;

        if vm.running_text {
            if let Some(text) = vm.current_text.take() {
                println!("{text}");
            }
            read_line()?;
            vm.resume();
            continue;
        }

        if vm.select_choice {
            let choices = vm.choices();
            for (i, choice) in choices.iter().enumerate() {
                println!("{}) {choice}", i + 1);
            }
            let line = read_line()?;
            let index: usize = line.trim().parse::<usize>().unwrap_or(1).saturating_sub(1);
            vm.choose_choice(index)?;
            continue;
        }

        if vm.scene_completed {
            println!("-- scene complete --");
            break;
        }
    }

    Ok(())
}

fn read_line() -> io::Result<String> {
    print!("> ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line)
}
