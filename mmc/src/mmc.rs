use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
};

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use minimatlab::{
    assem::{x86_64::X86Asm, Codegen},
    errors::TranslateError,
    util,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "miniMatlab compiler", long_about = None, override_usage = "mmc [Option] <FILES>...")]
struct Args {
    /// The .mm files to compile, or `-` for standard input. Each one is translated on its own.
    #[arg(required = true)]
    files: Vec<String>,

    /// Write the intermediate code and symbol tables (.mic) instead of assembly (.s).
    #[arg(long)]
    emit_mic: bool,

    /// Log every quad as it is emitted. Implies --log-level trace.
    #[arg(long)]
    trace_tacos: bool,

    /// Maximum level of the diagnostic log written to stderr.
    #[arg(long, default_value_t = Level::WARN)]
    log_level: Level,
}

/// Where the output for `file` goes; `None` means stdout.
fn output_path(file: &str, emit_mic: bool) -> Option<String> {
    if file == "-" {
        return None;
    }
    let ext = if emit_mic { "mic" } else { "s" };
    Some(
        Path::new(file)
            .with_extension(ext)
            .to_string_lossy()
            .into_owned(),
    )
}

fn read_input(file: &str) -> anyhow::Result<String> {
    if file == "-" {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .context("unable to read standard input")?;
        return Ok(input);
    }
    if Path::new(file).extension().and_then(|e| e.to_str()) != Some("mm") {
        return Err(TranslateError::BadInputFile(file.to_string()).into());
    }
    fs::read_to_string(file).with_context(|| format!("unable to read {}", file))
}

fn compile_file(file: &str, args: &Args) -> anyhow::Result<()> {
    let input = read_input(file)?;
    let name = if file == "-" { "stdin" } else { file };
    let mic = minimatlab::translate(name, &input, args.trace_tacos)?;

    let mut out: Box<dyn Write> = match output_path(file, args.emit_mic) {
        Some(path) => {
            info!(file, output = %path, "writing output");
            Box::new(io::BufWriter::new(
                fs::File::create(&path).with_context(|| format!("unable to create {}", path))?,
            ))
        }
        None => Box::new(io::stdout()),
    };
    if args.emit_mic {
        mic.emit_mic(&mut out)?;
    } else {
        let asm = X86Asm::code_gen(&mic)?;
        out.write_all(asm.as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            // clap's own exit code for usage errors is 2.
            let _ = e.print();
            util::exit(util::ReturnCode::ExUsage);
        }
        Err(e) => e.exit(),
    };
    let level = if args.trace_tacos {
        Level::TRACE
    } else {
        args.log_level
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .init();

    let rc = run(&args, &mut io::stderr());
    util::exit(rc);
}

/// Compiles every file in `args`, one status line per file on `status`. A file
/// that fails is reported and the batch moves on to the next one.
fn run(args: &Args, status: &mut dyn Write) -> util::ReturnCode {
    let mut failed = 0;
    for file in &args.files {
        // status lines are best effort; a closed stderr must not stop the batch.
        match compile_file(file, args) {
            Ok(()) => {
                let _ = writeln!(status, "{} : compiled successfully", file);
            }
            Err(e) => {
                failed += 1;
                let _ = writeln!(status, "Fatal error : {} : {:#}", file, e);
            }
        }
    }
    info!(files = args.files.len(), failed, "batch finished");
    if failed > 0 {
        util::ReturnCode::OtherErrors
    } else {
        util::ReturnCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    /// A fresh scratch directory holding `files`.
    fn scratch(name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mmc-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        for (file, text) in files {
            fs::write(dir.join(file), text).unwrap();
        }
        dir
    }

    fn args(files: &[String]) -> Args {
        Args::try_parse_from(std::iter::once("mmc".to_string()).chain(files.iter().cloned())).unwrap()
    }

    #[test]
    fn failing_files_do_not_stop_the_batch() {
        let dir = scratch(
            "batch",
            &[
                ("first.mm", "int main() { int a; a = 1; return a; }"),
                ("syntax.mm", "int main( { return 0; }"),
                ("huge.mm", "Matrix A[100000][100000];\nint main() { return 0; }"),
                ("last.mm", "int main() { return 2; }"),
                ("notes.txt", "int main() { return 0; }"),
            ],
        );
        let files: Vec<String> = ["first.mm", "syntax.mm", "notes.txt", "huge.mm", "last.mm"]
            .iter()
            .map(|f| dir.join(f).display().to_string())
            .collect();
        let mut status = Vec::new();
        assert_eq!(util::ReturnCode::OtherErrors, run(&args(&files), &mut status));

        let status = String::from_utf8(status).unwrap();
        // every file is reported, in command line order.
        let ok = |f: &String| format!("{} : compiled successfully", f);
        let fatal = |f: &String| format!("Fatal error : {} : ", f);
        let expected = [
            ok(&files[0]),
            fatal(&files[1]),
            format!("{}Not a .mm file", fatal(&files[2])),
            fatal(&files[3]),
            ok(&files[4]),
        ];
        let mut at = 0;
        for e in &expected {
            at += status[at..]
                .find(e.as_str())
                .unwrap_or_else(|| panic!("`{}` missing or out of order in\n{}", e, status));
        }
        assert!(status.contains("too large"), "{}", status);
        assert!(dir.join("first.s").exists());
        assert!(dir.join("last.s").exists());
        assert!(!dir.join("huge.s").exists());
    }

    #[test]
    fn clean_batch_exits_ok() {
        let dir = scratch("clean", &[("a.mm", "int main() { return 0; }")]);
        let file = dir.join("a.mm").display().to_string();
        let mut a = args(&[file.clone(), "--emit-mic".into()]);
        let mut status = Vec::new();
        assert_eq!(util::ReturnCode::Ok, run(&a, &mut status));
        assert!(dir.join("a.mic").exists());

        a.emit_mic = false;
        assert_eq!(util::ReturnCode::Ok, run(&a, &mut Vec::new()));
        assert!(dir.join("a.s").exists());
    }

    #[test]
    fn non_mm_paths_are_bad_input() {
        let err = read_input("program.c").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TranslateError>(),
            Some(TranslateError::BadInputFile(f)) if f == "program.c"
        ));
        assert_eq!(Some("prog.s".to_string()), output_path("prog.mm", false));
        assert_eq!(None, output_path("-", true));
    }
}
