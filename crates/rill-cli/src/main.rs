use std::{env, fs, process::ExitCode, time::Instant};

use rill::{Module, Object, StderrTracer};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let mut file_path = None;
    let mut trace = false;
    for arg in &args[1..] {
        match arg.as_str() {
            "--trace" => trace = true,
            "--help" | "-h" => {
                eprintln!("usage: rill [--trace] <script.rl>");
                return ExitCode::SUCCESS;
            }
            other => file_path = Some(other.to_owned()),
        }
    }
    let Some(file_path) = file_path else {
        eprintln!("usage: rill [--trace] <script.rl>");
        return ExitCode::FAILURE;
    };

    let code = match fs::read_to_string(&file_path) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: cannot read {file_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut module = Module::new(&file_path);
    if trace {
        module.set_tracer(StderrTracer);
    }

    let start = Instant::now();
    match module.eval(&code) {
        Ok(Object::Void) => {
            eprintln!("done in {:?}", start.elapsed());
            ExitCode::SUCCESS
        }
        Ok(value) => {
            println!("{value}");
            eprintln!("done in {:?}", start.elapsed());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error after {:?}:\n{err}", start.elapsed());
            ExitCode::FAILURE
        }
    }
}
