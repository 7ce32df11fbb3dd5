// Copyright 2024 Mara Kessler
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, BufRead, Write};

use pvfs_fs::FileSystem;
use pvfs_shell::process_command;

fn main() {
    env_logger::init();

    let mut fs = FileSystem::initialize();
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let output = process_command(&mut fs, &line);
        // `dr`'s output already carries its own trailing newline; every
        // other command's does not.
        let result = if output.ends_with('\n') {
            write!(out, "{output}")
        } else {
            writeln!(out, "{output}")
        };
        let _ = result;
    }
}
