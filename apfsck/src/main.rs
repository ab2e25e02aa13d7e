//! apfsck — consistency checker for APFS containers
//!
//! Walks the container object map, every volume's object map, and every
//! volume's catalog B-tree, verifying the structural invariants the format
//! guarantees. Read-only: never writes to the device, never repairs.
//!
//! # Usage
//!
//! ```text
//! apfsck <device-or-image>
//! ```

mod style;

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::process;
use std::time::Instant;

use apfs::Checker;
use style::{BOLD, DIM, GREEN, RED, RESET};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "-h" | "--help" | "help" => {
            print_usage();
        }
        path => run(path),
    }
}

fn run(path: &str) {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{RED}error:{RESET} cannot open {path}: {e}");
            process::exit(1);
        }
    };
    let reader = BufReader::new(file);
    let mut checker = Checker::new(reader);

    style::header(&format!("apfsck: {path}"));

    let t = Instant::now();
    match checker.run() {
        Ok(report) => {
            let elapsed = style::format_duration(t.elapsed());
            style::section("Result");
            style::kv_highlight("Status", "PASS");
            style::kv("Volumes checked", &report.volumes_checked.to_string());
            style::kv("Nodes visited", &style::format_commas(report.nodes_visited));
            style::kv("Deepest level reached", &report.max_depth.to_string());
            style::kv("Elapsed", &elapsed);
            println!();
            println!("  {DIM}{BOLD}{GREEN}apfsck: {path}: clean{RESET}");
            println!();
        }
        Err(e) => {
            println!();
            println!("  {RED}{BOLD}apfsck: {path}: FAIL: {e}{RESET}");
            println!();
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}apfsck{RESET} — APFS consistency checker

{DIM}Walks the container and volume object maps plus every volume's catalog{RESET}
{DIM}B-tree, verifying checksums, key ordering, and structural invariants.{RESET}

{BOLD}USAGE:{RESET}
    apfsck <device-or-image>

{BOLD}EXIT STATUS:{RESET}
    0   every tree walked clean
    1   a fatal inconsistency was found, or the file could not be opened
"#
    );
}
