// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Exit codes and log output of the daemon binary

use std::io::Write;
use std::process::{Command, Output};

fn run_daemon(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_axeminer"))
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .expect("cannot run daemon")
}

fn log_text(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stdout));
    text
}

#[test]
fn test_broken_settings_file_is_fatal() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "asicfrequency = [not toml").unwrap();
    let path = file.path().to_str().unwrap();

    // the error must be flushed before the process exits, every time
    for _ in 0..3 {
        let output = run_daemon(&["--config", path]);
        assert_eq!(output.status.code(), Some(1));
        assert!(
            log_text(&output).contains("Cannot open settings file"),
            "missing error in {:?}",
            log_text(&output)
        );
    }
}

#[test]
fn test_set_writes_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    let path = path.to_str().unwrap();

    let output = run_daemon(&["--config", path, "set", "asicfrequency", "490"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(log_text(&output).contains("Stored asicfrequency = 490"));
    let content = std::fs::read_to_string(path).unwrap();
    assert!(content.contains("asicfrequency = 490"), "{}", content);

    let output = run_daemon(&["--config", path, "set", "nosuchkey", "1"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(log_text(&output).contains("Cannot store nosuchkey"));
}
