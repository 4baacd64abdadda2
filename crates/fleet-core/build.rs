use std::env;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
	let output = Command::new("git").args(args).output().ok()?;
	if !output.status.success() {
		return None;
	}
	let s = String::from_utf8(output.stdout).ok()?;
	let s = s.trim();
	if s.is_empty() { None } else { Some(s.to_string()) }
}

fn main() {
	let out_dir = env::var("OUT_DIR").unwrap();
	let profile_name = out_dir
		.split(std::path::MAIN_SEPARATOR)
		.nth_back(3)
		.unwrap();
	let target = env::var("TARGET").unwrap();

	let revision = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
	let tag = git(&["describe", "--tags", "--always", "--dirty"]).unwrap_or_else(|| "unknown".to_string());
	let status = if git(&["diff", "--quiet"]).is_some() {
		"clean"
	} else {
		"modified"
	};

	println!("cargo:rustc-env=FLEET_BUILD_GIT_REVISION={revision}");
	println!("cargo:rustc-env=FLEET_BUILD_GIT_TAG={tag}");
	println!("cargo:rustc-env=FLEET_BUILD_STATUS={status}");
	println!(
		"cargo:rustc-env=FLEET_BUILD_RUSTC_VERSION={}",
		rustc_version::version().unwrap()
	);
	println!("cargo:rustc-env=FLEET_BUILD_PROFILE_NAME={profile_name}");
	println!("cargo:rustc-env=FLEET_BUILD_TARGET={target}");
	println!("cargo:rerun-if-env-changed=VERSION");
	println!("cargo:rerun-if-changed=../../.git/HEAD");
}
