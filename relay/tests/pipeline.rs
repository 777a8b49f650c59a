use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::{Builder, TempDir};

const RELAY: &str = env!("CARGO_BIN_EXE_shardcast-relay");

fn payload_of(shard_id: u32) -> Vec<u8> {
    format!("<shard {:04}>", shard_id).repeat(1 + shard_id as usize % 5).into_bytes()
}

struct Scenario {
    dir: TempDir,
    config_path: PathBuf,
}

impl Scenario {
    fn new(shard_count: u32, fan_count: u32, slot_count: usize) -> Scenario {
        let dir = Builder::new().prefix("shardcast_pipeline").tempdir().expect("temp dir");
        let shards_dir = dir.path().join("shards");
        fs::create_dir_all(&shards_dir).expect("shards dir");
        for shard_id in 0..shard_count {
            fs::write(shards_dir.join(format!("shard_{:04}.bin", shard_id)), payload_of(shard_id))
                .expect("write shard");
        }

        let config_path = dir.path().join("shardcast.toml");
        let config = format!(
            "[shmem]\n\
            data_dir = \"{data_dir}\"\n\
            shmem_file_name = \"slots\"\n\
            slot_count = {slot_count}\n\
            max_shard_size = 4096\n\
            open_timeout_ms = 5000\n\
            \n\
            [run]\n\
            shard_count = {shard_count}\n\
            fan_count = {fan_count}\n\
            backoff_us = 100\n\
            receive_timeout_ms = 30000\n\
            \n\
            [storage]\n\
            shards_dir = \"{shards_dir}\"\n\
            extension = \".bin\"\n\
            \n\
            [assembly]\n\
            work_dir = \"{work_dir}\"\n\
            output_name = \"joined\"\n\
            play = false\n",
            data_dir = dir.path().display(),
            slot_count = slot_count,
            shard_count = shard_count,
            fan_count = fan_count,
            shards_dir = shards_dir.display(),
            work_dir = dir.path().join("work").display(),
        );
        fs::write(&config_path, config).expect("write config");
        Scenario { dir, config_path }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn configure(&self, from: &str, to: &str) {
        let config = fs::read_to_string(&self.config_path).expect("read config");
        assert!(config.contains(from), "config has no {:?}", from);
        fs::write(&self.config_path, config.replace(from, to)).expect("rewrite config");
    }

    // Output goes to a file so chatty children never block on a full pipe.
    fn spawn_run(&self) -> Child {
        let log = File::create(self.path("run.log")).expect("log file");
        Command::new(RELAY)
            .arg("--config")
            .arg(&self.config_path)
            .arg("run")
            .stdout(log.try_clone().expect("clone log file"))
            .stderr(log)
            .spawn()
            .expect("spawn relay")
    }

    fn log(&self) -> String {
        let log = fs::read_to_string(self.path("run.log")).unwrap_or_default();
        println!("log:\n{}", log);
        log
    }

    fn relay(&self, args: &[&str]) -> Output {
        let output = Command::new(RELAY)
            .arg("--config")
            .arg(&self.config_path)
            .args(args)
            .output()
            .expect("run relay");
        println!("stdout:\n{}", String::from_utf8_lossy(&output.stdout));
        println!("stderr:\n{}", String::from_utf8_lossy(&output.stderr));
        output
    }
}

fn expected_output(shard_count: u32) -> Vec<u8> {
    (0..shard_count).flat_map(payload_of).collect()
}

fn wait_within(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("poll relay") {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
    None
}

fn assert_no_link(dir: &Path) {
    assert!(!dir.join("slots").exists(), "shared region link was left behind");
}

#[test]
fn run_reassembles_every_shard() {
    let scenario = Scenario::new(24, 5, 4);
    let output = scenario.relay(&["run"]);
    assert!(output.status.success());

    let joined = fs::read(scenario.path("work/joined.bin")).expect("joined output");
    assert_eq!(joined, expected_output(24));
    assert!(scenario.path("work/shard_0023.bin").exists());
    assert_no_link(scenario.dir.path());
}

#[test]
fn single_fan_single_slot() {
    let scenario = Scenario::new(2, 1, 1);
    let output = scenario.relay(&["run"]);
    assert!(output.status.success());
    let joined = fs::read(scenario.path("work/joined.bin")).expect("joined output");
    assert_eq!(joined, expected_output(2));
}

#[test]
fn missing_shard_fails_the_run() {
    let scenario = Scenario::new(8, 2, 2);
    fs::remove_file(scenario.path("shards/shard_0005.bin")).expect("remove shard");

    let output = scenario.relay(&["run"]);
    assert!(!output.status.success());
    assert!(!scenario.path("work/joined.bin").exists());
    assert_no_link(scenario.dir.path());
}

#[test]
fn fan_rejects_a_foreign_group() {
    let scenario = Scenario::new(8, 2, 2);
    let output = scenario.relay(&["fan", "--id", "0", "--first", "4", "--count", "4"]);
    assert!(!output.status.success());
}

#[test]
fn invalid_config_is_rejected() {
    let scenario = Scenario::new(2, 1, 1);
    scenario.configure("fan_count = 1", "fan_count = 3");
    let output = scenario.relay(&["run"]);
    assert!(!output.status.success());
}

#[test]
fn failed_jockey_ends_the_run() {
    let scenario = Scenario::new(200, 2, 1);
    scenario.configure("receive_timeout_ms = 30000", "receive_timeout_ms = 1");

    let mut run = scenario.spawn_run();
    let status = wait_within(&mut run, Duration::from_secs(20));
    let log = scenario.log();
    let status = status.expect("run kept going after the jockey gave up");
    assert!(!status.success());
    assert!(log.contains("Child process jockey failed"));
    assert!(!scenario.path("work/joined.bin").exists());
    assert_no_link(scenario.dir.path());
}

#[cfg(unix)]
#[test]
fn sigterm_stops_the_run() {
    let scenario = Scenario::new(120, 2, 1);
    scenario.configure("backoff_us = 100", "backoff_us = 200000");
    scenario.configure("receive_timeout_ms = 30000", "receive_timeout_ms = 0");

    let mut run = scenario.spawn_run();
    thread::sleep(Duration::from_millis(500));
    let killed = Command::new("kill")
        .arg("-TERM")
        .arg(run.id().to_string())
        .status()
        .expect("run kill");
    assert!(killed.success());

    let status = wait_within(&mut run, Duration::from_secs(10));
    scenario.log();
    assert!(!status.expect("run ignored SIGTERM").success());
    assert_no_link(scenario.dir.path());
}

#[test]
fn work_dir_holding_the_shards_is_rejected() {
    let scenario = Scenario::new(4, 2, 2);
    let work_dir = scenario.path("work").display().to_string();
    let root = scenario.dir.path().display().to_string();
    scenario.configure(
        &format!("work_dir = \"{}\"", work_dir),
        &format!("work_dir = \"{}\"", root),
    );

    let output = scenario.relay(&["run"]);
    assert!(!output.status.success());
    assert!(scenario.path("shards/shard_0003.bin").exists());
    assert!(scenario.config_path.exists());
}

#[test]
fn fan_group_overflow_is_an_error() {
    let scenario = Scenario::new(8, 2, 2);
    let output = scenario.relay(&["fan", "--id", "0", "--first", "4294967295", "--count", "2"]);
    assert_eq!(output.status.code(), Some(1));
}
