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

//! Line-oriented command shell over [`pvfs_fs::FileSystem`]. One command per
//! line, one line of output per command; any failure anywhere in parsing or
//! execution renders as the literal string `error`.

use std::fs::File;

use pvfs_fs::FileSystem;

const ERROR: &str = "error";

/// Parses and runs a single command line against `fs`, returning the line
/// of output it produces. An empty line produces an empty line of output.
pub fn process_command(fs: &mut FileSystem, line: &str) -> String {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return String::new();
    }
    let args: Vec<&str> = line.split_whitespace().collect();
    run(fs, &args).unwrap_or_else(|| ERROR.to_string())
}

/// Returns `None` on any parse or execution failure, which the caller maps
/// to the literal `error` token.
fn run(fs: &mut FileSystem, args: &[&str]) -> Option<String> {
    match *args.first()? {
        "cr" => {
            let name = args.get(1)?;
            fs.create(name).ok()?;
            Some(format!("{name} created"))
        }
        "de" => {
            let name = args.get(1)?;
            fs.destroy(name).ok()?;
            Some(format!("{name} destroyed"))
        }
        "op" => {
            let name = args.get(1)?;
            let k = fs.open(name).ok()?;
            Some(format!("{name} opened {k}"))
        }
        "cl" => {
            let k: usize = args.get(1)?.parse().ok()?;
            fs.close(k).ok()?;
            Some(format!("{k} closed"))
        }
        "rd" => {
            let k: usize = args.get(1)?.parse().ok()?;
            let count: usize = args.get(2)?.parse().ok()?;
            let bytes = fs.read(k, count).ok()?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        "wr" => {
            let k: usize = args.get(1)?.parse().ok()?;
            let byte = args.get(2)?.as_bytes().first().copied()?;
            let count: usize = args.get(3)?.parse().ok()?;
            let written = fs.write(k, byte, count).ok()?;
            Some(format!("{written} bytes written"))
        }
        "sk" => {
            let k: usize = args.get(1)?.parse().ok()?;
            let pos: i32 = args.get(2)?.parse().ok()?;
            fs.lseek(k, pos).ok()?;
            Some(format!("position is {pos}"))
        }
        "dr" => {
            let mut out = String::new();
            for name in fs.directory() {
                out.push_str(&name);
                out.push(' ');
            }
            out.push('\n');
            Some(out)
        }
        "in" => {
            if let Some(&path) = args.get(1) {
                let file = File::open(path).ok()?;
                *fs = FileSystem::restore(file).ok()?;
                Some("disk restored".to_string())
            } else {
                *fs = FileSystem::initialize();
                Some("disk initialized".to_string())
            }
        }
        "sv" => {
            let path = args.get(1)?;
            let file = File::create(path).ok()?;
            fs.save(file).ok()?;
            Some("disk saved".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> FileSystem {
        FileSystem::initialize()
    }

    #[test]
    fn blank_line_is_empty_output() {
        let mut fs = fresh();
        assert_eq!(process_command(&mut fs, ""), "");
    }

    #[test]
    fn scenario_s1_repeated_writes_then_seek_then_read() {
        let mut fs = fresh();
        assert_eq!(process_command(&mut fs, "cr foo"), "foo created");
        assert_eq!(process_command(&mut fs, "op foo"), "foo opened 1");
        assert_eq!(process_command(&mut fs, "wr 1 x 60"), "60 bytes written");
        assert_eq!(process_command(&mut fs, "wr 1 y 10"), "10 bytes written");
        assert_eq!(process_command(&mut fs, "wr 1 y 10"), "10 bytes written");
        assert_eq!(process_command(&mut fs, "sk 1 16"), "position is 16");
        assert_eq!(process_command(&mut fs, "rd 1 5"), "xxxxx");
    }

    #[test]
    fn scenario_s2_destroy_then_recreate_then_list() {
        let mut fs = fresh();
        process_command(&mut fs, "cr foo");
        process_command(&mut fs, "de foo");
        process_command(&mut fs, "cr foo");
        assert_eq!(process_command(&mut fs, "dr"), "foo \n");
    }

    #[test]
    fn scenario_s4_full_write_then_boundary_seek() {
        let mut fs = fresh();
        process_command(&mut fs, "cr foo");
        process_command(&mut fs, "op foo");
        assert_eq!(process_command(&mut fs, "wr 1 a 192"), "192 bytes written");
        process_command(&mut fs, "cl 1");
        process_command(&mut fs, "op foo");
        assert_eq!(process_command(&mut fs, "sk 1 191"), "position is 191");
        assert_eq!(process_command(&mut fs, "rd 1 1"), "a");
        assert_eq!(process_command(&mut fs, "sk 1 192"), "error");
    }

    #[test]
    fn scenario_s5_duplicate_create_errors() {
        let mut fs = fresh();
        process_command(&mut fs, "cr foo");
        assert_eq!(process_command(&mut fs, "cr foo"), "error");
    }

    #[test]
    fn unknown_command_and_bad_args_error() {
        let mut fs = fresh();
        assert_eq!(process_command(&mut fs, "xx"), "error");
        assert_eq!(process_command(&mut fs, "cl notanumber"), "error");
        assert_eq!(process_command(&mut fs, "cr"), "error");
    }

    #[test]
    fn save_then_restore_through_shell_commands() {
        let mut fs = fresh();
        process_command(&mut fs, "cr foo");
        let dir = std::env::temp_dir().join("pvfs_shell_test_snapshot.bin");
        let path = dir.to_str().unwrap();
        assert_eq!(process_command(&mut fs, &format!("sv {path}")), "disk saved");
        assert_eq!(
            process_command(&mut fs, &format!("in {path}")),
            "disk restored"
        );
        assert_eq!(process_command(&mut fs, "dr"), "foo \n");
        let _ = std::fs::remove_file(dir);
    }
}
