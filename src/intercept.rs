//! Traffic interception for the fixed link-local metadata endpoint.

// std
use std::{
	net::Ipv4Addr,
	path::{Path, PathBuf},
	str::FromStr,
};
// crates.io
use tokio::process::Command;
// self
use crate::{
	_prelude::*,
	inventory::{Node, types::NODE_ROUTING_MODE_KEY},
};

/// Link-local address workloads expect the metadata server at.
pub const LINK_LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);
/// Port workloads expect the metadata server at.
pub const LINK_LOCAL_PORT: u16 = 80;

// Loopback aliases carry a label so teardown never touches foreign addresses.
const LOOPBACK_LABEL: &str = "lo:metadata";

/// Selectable interception mechanism for one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RoutingMode {
	/// A `connect4` cgroup program rewrites destination addresses in-kernel.
	#[default]
	Ebpf,
	/// The link-local address is aliased onto the loopback interface; the
	/// emulator must bind `169.254.169.254:80` in the host network namespace.
	Loopback,
	/// Nothing is installed; external orchestration delivers the traffic.
	None,
}
impl RoutingMode {
	/// Routing mode selected on the node; the annotation wins over the label
	/// of the same name, and unknown values fall back to the default.
	pub fn from_node(node: &Node) -> Self {
		match node.annotation_or_label(NODE_ROUTING_MODE_KEY) {
			None => Self::default(),
			Some(raw) => raw.parse().unwrap_or_else(|_| {
				tracing::warn!(value = raw, "unknown routing mode on node, using default");

				Self::default()
			}),
		}
	}
}
impl FromStr for RoutingMode {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		match raw {
			"eBPF" => Ok(Self::Ebpf),
			"Loopback" => Ok(Self::Loopback),
			"None" => Ok(Self::None),
			_ => Err(Error::Validation {
				field: "routing_mode",
				reason: format!("Expected eBPF, Loopback, or None, got {raw:?}."),
			}),
		}
	}
}

/// Filesystem locations used by the eBPF loader.
#[derive(Clone, Debug)]
pub struct EbpfSettings {
	/// Compiled `connect4` object shipped with the emulator image.
	pub object_path: PathBuf,
	/// bpffs directory holding the program and map pins.
	pub pin_dir: PathBuf,
	/// Root control group the program attaches to.
	pub cgroup_path: PathBuf,
	/// Turn on the program's trace logging.
	pub debug: bool,
}

/// Undoes an installed interception mechanism.
///
/// Dropped guards leak the installation on purpose; call [`close`] during
/// shutdown.
///
/// [`close`]: InterceptGuard::close
#[derive(Debug, Default)]
pub struct InterceptGuard {
	commands: Vec<Vec<String>>,
	remove_paths: Vec<PathBuf>,
}
impl InterceptGuard {
	/// Reverse the installation: detach programs, delete addresses and pins.
	pub async fn close(self) -> Result<()> {
		for argv in &self.commands {
			if let Err(err) = run(argv).await {
				tracing::warn!(command = ?argv, error = %err, "interception teardown step failed");
			}
		}
		for path in &self.remove_paths {
			if let Err(err) = tokio::fs::remove_file(path).await {
				tracing::warn!(path = %path.display(), error = %err, "failed to remove pin");
			}
		}

		Ok(())
	}
}

/// Install the selected interception mechanism and return its teardown guard.
pub async fn install(
	mode: RoutingMode,
	emulator_ip: Ipv4Addr,
	emulator_port: u16,
	ebpf: &EbpfSettings,
) -> Result<InterceptGuard> {
	match mode {
		RoutingMode::None => Ok(InterceptGuard::default()),
		RoutingMode::Loopback => {
			run(&loopback_add_args()).await?;
			tracing::info!(address = %LINK_LOCAL_ADDR, "aliased link-local address onto loopback");

			Ok(InterceptGuard {
				commands: vec![loopback_del_args()],
				remove_paths: Vec::new(),
			})
		},
		RoutingMode::Ebpf => {
			let prog_pin = ebpf.pin_dir.join("connect4");
			let map_pin = ebpf.pin_dir.join("config");

			tokio::fs::create_dir_all(&ebpf.pin_dir).await?;
			run(&ebpf_load_args(&ebpf.object_path, &prog_pin, &ebpf.pin_dir)).await?;
			run(&ebpf_map_update_args(&map_pin, emulator_ip, emulator_port, ebpf.debug)).await?;
			run(&ebpf_attach_args(&ebpf.cgroup_path, &prog_pin)).await?;
			tracing::info!(
				cgroup = %ebpf.cgroup_path.display(),
				%emulator_ip,
				emulator_port,
				"attached connect4 program"
			);

			Ok(InterceptGuard {
				commands: vec![ebpf_detach_args(&ebpf.cgroup_path, &prog_pin)],
				remove_paths: vec![prog_pin, map_pin],
			})
		},
	}
}

fn loopback_add_args() -> Vec<String> {
	args([
		"ip",
		"addr",
		"replace",
		&format!("{LINK_LOCAL_ADDR}/32"),
		"dev",
		"lo",
		"label",
		LOOPBACK_LABEL,
	])
}

fn loopback_del_args() -> Vec<String> {
	args(["ip", "addr", "del", &format!("{LINK_LOCAL_ADDR}/32"), "dev", "lo"])
}

fn ebpf_load_args(object: &Path, prog_pin: &Path, pin_dir: &Path) -> Vec<String> {
	args([
		"bpftool",
		"prog",
		"load",
		&object.display().to_string(),
		&prog_pin.display().to_string(),
		"type",
		"cgroup/connect4",
		"pinmaps",
		&pin_dir.display().to_string(),
	])
}

// Map layout: key 0 (u32), value = destination IPv4, port, debug flag, pad.
fn ebpf_map_update_args(map_pin: &Path, ip: Ipv4Addr, port: u16, debug: bool) -> Vec<String> {
	let mut argv = args([
		"bpftool",
		"map",
		"update",
		"pinned",
		&map_pin.display().to_string(),
		"key",
		"hex",
		"00",
		"00",
		"00",
		"00",
		"value",
		"hex",
	]);

	for byte in ip.octets() {
		argv.push(format!("{byte:02x}"));
	}
	for byte in port.to_be_bytes() {
		argv.push(format!("{byte:02x}"));
	}

	argv.push(format!("{:02x}", u8::from(debug)));
	argv.push("00".to_owned());

	argv
}

fn ebpf_attach_args(cgroup: &Path, prog_pin: &Path) -> Vec<String> {
	args([
		"bpftool",
		"cgroup",
		"attach",
		&cgroup.display().to_string(),
		"connect4",
		"pinned",
		&prog_pin.display().to_string(),
		"multi",
	])
}

fn ebpf_detach_args(cgroup: &Path, prog_pin: &Path) -> Vec<String> {
	args([
		"bpftool",
		"cgroup",
		"detach",
		&cgroup.display().to_string(),
		"connect4",
		"pinned",
		&prog_pin.display().to_string(),
	])
}

fn args<const N: usize>(argv: [&str; N]) -> Vec<String> {
	argv.into_iter().map(str::to_owned).collect()
}

async fn run(argv: &[String]) -> Result<()> {
	let Some((program, rest)) = argv.split_first() else {
		return Ok(());
	};
	let output = Command::new(program).args(rest).output().await?;

	if !output.status.success() {
		return Err(Error::Intercept(format!(
			"{} exited with {}: {}",
			argv.join(" "),
			output.status,
			String::from_utf8_lossy(&output.stderr).trim()
		)));
	}

	Ok(())
}
