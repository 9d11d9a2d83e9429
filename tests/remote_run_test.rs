use std::fs;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

use xpcremote::config::{Config, HarnessOptions};
use xpcremote::device::{
    DeviceCall, DeviceSession, RetryConfig, ScriptedDevice, ShellScript, PROP_CPU_ABI,
    PROP_CPU_ABILIST, PROP_SDK_VERSION,
};
use xpcremote::error::Error;
use xpcremote::manifest::TestDescriptor;
use xpcremote::remote::{RemoteHarness, TestOutcome};

const TEST_ROOT: &str = "/data/local/tmp/test_root";
const REMOTE_BIN: &str = "/data/local/tmp/test_root/xpc/bin";
const REMOTE_SCRIPTS: &str = "/data/local/tmp/test_root/xpc/s";
const REMOTE_MINIDUMPS: &str = "/data/local/tmp/test_root/xpc/minidumps";

fn write_file(path: &Path, contents: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Lays out a minimal build tree: harness binaries, httpd.js, a test tree
/// and optionally an unpacked distribution.
fn create_objdir(with_dist: bool) -> TempDir {
    let obj = TempDir::new().unwrap();
    let root = obj.path();
    write_file(&root.join("dist/bin/xpcshell"), b"\x7fELF");
    write_file(&root.join("dist/bin/certutil"), b"\x7fELF");
    write_file(&root.join("dist/bin/components/httpd.js"), b"// httpd");
    write_file(&root.join("_tests/xpcshell/head.js"), b"// head");
    write_file(&root.join("_tests/xpcshell/dom/head_dom.js"), b"// dom head");
    write_file(&root.join("_tests/xpcshell/dom/test_a.js"), b"// a");
    write_file(&root.join("_tests/xpcshell/dom/test_b.js"), b"// b");
    write_file(&root.join("_tests/xpcshell/netwerk/unit/test_c.js"), b"// c");
    if with_dist {
        write_file(&root.join("dist/b2g/libxul.so"), b"\x7fELF");
    }
    obj
}

fn create_apk(path: &Path, entries: &[&str]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    for entry in entries {
        writer.start_file(*entry, options).unwrap();
        writer.write_all(b"payload").unwrap();
    }
    writer.finish().unwrap();
}

fn arm_device() -> Rc<ScriptedDevice> {
    let device = Rc::new(ScriptedDevice::with_serial("emulator-5554"));
    device.script_property(PROP_CPU_ABI, &["arm64-v8a"]);
    device.script_property(PROP_CPU_ABILIST, &["arm64-v8a,armeabi-v7a"]);
    device.script_property(PROP_SDK_VERSION, &["30"]);
    device
}

fn session(device: &Rc<ScriptedDevice>) -> DeviceSession {
    DeviceSession::new(Box::new(device.clone()), TEST_ROOT)
        .with_retry_config(RetryConfig::new(3, 0))
}

fn options(obj: &Path, configure: impl FnOnce(&mut Config)) -> HarnessOptions {
    let mut config = Config::default();
    config.harness.objdir = Some(obj.to_path_buf());
    configure(&mut config);
    config.harness_options().unwrap()
}

fn tests(obj: &Path, names: &[&str]) -> Vec<TestDescriptor> {
    names
        .iter()
        .map(|name| TestDescriptor::new(obj.join("_tests/xpcshell").join(name)))
        .collect()
}

fn position(calls: &[DeviceCall], from: usize, pred: impl Fn(&DeviceCall) -> bool) -> usize {
    from + calls[from..].iter().position(pred).unwrap()
}

#[test]
fn test_abi_falls_back_to_list_entry_with_libraries() {
    let obj = create_objdir(false);
    let apk = obj.path().join("geckoview-test.apk");
    create_apk(&apk, &["AndroidManifest.xml", "lib/armeabi-v7a/libxul.so"]);

    let device = arm_device();
    let opts = options(obj.path(), |c| c.harness.package = Some(apk.clone()));
    let mut harness = RemoteHarness::new(opts, session(&device));
    let summary = harness
        .run(&tests(obj.path(), &["dom/test_a.js"]))
        .unwrap();

    assert_eq!(harness.selected_abi().unwrap().as_str(), "armeabi-v7a");
    assert_eq!(
        harness.environment().unwrap().get("MOZ_ANDROID_CPU_ABI"),
        Some("armeabi-v7a")
    );
    assert!(device.file_exists(&format!("{}/libxul.so", REMOTE_BIN)));
    assert!(device.file_exists(&format!("{}/geckoview-test.apk", REMOTE_BIN)));
    assert!(device.file_exists(&format!("{}/xpcshell", REMOTE_BIN)));
    assert!(device.file_exists(&format!("{}/dom/test_a.js", REMOTE_SCRIPTS)));
    assert!(device.file_exists(&format!("{}/head.js", REMOTE_SCRIPTS)));
    assert!(device.file_exists("/data/local/tmp/test_root/xpc/c/httpd.js"));

    let wrapper = device.file_contents(&format!("{}/xpcw", REMOTE_BIN)).unwrap();
    let wrapper = String::from_utf8(wrapper).unwrap();
    assert!(wrapper.contains("export MOZ_ANDROID_CPU_ABI=armeabi-v7a\n"));
    assert!(wrapper.ends_with(&format!("{}/xpcshell \"$@\"\n", REMOTE_BIN)));

    let commands = device.shell_commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains(&format!("--greomni {}/geckoview-test.apk", REMOTE_BIN)));
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn test_timeout_is_recorded_and_next_test_runs() {
    let obj = create_objdir(true);
    let device = arm_device();
    device.script_shell(ShellScript::Timeout);
    device.script_shell(ShellScript::Exit(0, "TEST-PASS".to_string()));
    device.fail_kills();

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    let summary = harness
        .run(&tests(obj.path(), &["dom/test_a.js", "dom/test_b.js"]))
        .unwrap();

    assert_eq!(summary.results[0].outcome, TestOutcome::TimedOut);
    assert_eq!(summary.results[1].outcome, TestOutcome::Passed);
    assert_eq!(summary.exit_code(), 1);

    // A kill of the harness follows the timed-out launch and precedes the
    // next test's launch, even though every kill fails.
    let calls = device.calls();
    let is_shell = |c: &DeviceCall| matches!(c, DeviceCall::Shell(_));
    let first = position(&calls, 0, is_shell);
    let kill = position(&calls, first, |c| matches!(c, DeviceCall::Pkill(n) if n == "xpcshell"));
    let second = position(&calls, first + 1, is_shell);
    assert!(first < kill && kill < second);
}

#[test]
fn test_timeout_on_unresponsive_device_still_resets_minidumps() {
    let obj = create_objdir(true);
    let device = arm_device();
    let test_list = tests(obj.path(), &["dom/test_a.js", "dom/test_b.js"]);

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    harness.prepare().unwrap();
    harness.register_tests(&test_list).unwrap();

    device.add_file(&format!("{}/0f1e.dmp", REMOTE_MINIDUMPS), b"MDMP");
    device.script_shell(ShellScript::Timeout);
    device.script_shell(ShellScript::Exit(0, "TEST-PASS".to_string()));
    device.fail_kills();
    device.fail_process_checks();
    let summary = harness.run_tests(&test_list).unwrap();

    assert_eq!(summary.results[0].outcome, TestOutcome::TimedOut);
    assert_eq!(summary.results[1].outcome, TestOutcome::Passed);
    assert!(device
        .calls()
        .iter()
        .any(|c| matches!(c, DeviceCall::Pull { remote, .. } if remote == REMOTE_MINIDUMPS)));
    assert!(device.files_under(REMOTE_MINIDUMPS).is_empty());
}

#[test]
fn test_distribution_tree_lands_in_bin() {
    let obj = create_objdir(true);
    write_file(&obj.path().join("dist/b2g/components/xpcom.manifest"), b"# xpcom");
    let device = arm_device();

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    harness.prepare().unwrap();

    assert!(device.file_exists(&format!("{}/libxul.so", REMOTE_BIN)));
    assert!(device.file_exists(&format!("{}/components/xpcom.manifest", REMOTE_BIN)));
    assert!(!device.dir_exists(&format!("{}/b2g", REMOTE_BIN)));
    assert!(device.file_exists(&format!("{}/xpcshell", REMOTE_BIN)));
}

#[test]
fn test_per_test_prefs_use_their_own_file() {
    let obj = create_objdir(true);
    let device = arm_device();
    let opts = options(obj.path(), |c| {
        c.prefs
            .insert("network.proxy.type".to_string(), serde_yaml::Value::from(0));
    });
    let mut test_list = tests(obj.path(), &["dom/test_a.js", "dom/test_b.js"]);
    test_list[1].prefs = vec![("dom.storage.enabled".to_string(), "false".to_string())];

    let mut harness = RemoteHarness::new(opts, session(&device));
    harness.run(&test_list).unwrap();

    let commands = device.shell_commands();
    assert!(commands[0].contains("_PREFS_FILE = \"/data/local/tmp/test_root/xpc/user.js\""));
    assert!(commands[1].contains("_PREFS_FILE = \"/data/local/tmp/test_root/xpc/tmp/user.js\""));
    let own = device
        .file_contents("/data/local/tmp/test_root/xpc/tmp/user.js")
        .unwrap();
    assert_eq!(
        own,
        b"user_pref(\"network.proxy.type\", 0);\nuser_pref(\"dom.storage.enabled\", false);\n"
    );
}

#[test]
fn test_shared_directory_registers_one_mapping() {
    let obj = create_objdir(true);
    let device = arm_device();

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    harness
        .run(&tests(obj.path(), &["dom/test_a.js", "dom/test_b.js"]))
        .unwrap();

    assert_eq!(harness.translator().len(), 1);
    let remote_dom = format!("{}/dom", REMOTE_SCRIPTS);
    assert_eq!(harness.translator().mappings()[0].remote, remote_dom);

    let commands = device.shell_commands();
    assert_eq!(commands.len(), 2);
    for (command, name) in commands.iter().zip(["test_a.js", "test_b.js"]) {
        let mut words = command.split(' ');
        assert_eq!(words.next(), Some(format!("{}/xpcw", REMOTE_BIN).as_str()));
        assert_eq!(words.next(), Some(remote_dom.as_str()));
        assert!(command.ends_with(&format!("'const _TEST_FILE = [\"{}\"];'", name)));
    }
}

#[test]
fn test_missing_runnable_target_fails_before_tests() {
    let obj = create_objdir(false);
    let device = arm_device();

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    let err = harness
        .run(&tests(obj.path(), &["dom/test_a.js"]))
        .unwrap_err();

    assert!(matches!(err, Error::Provisioning(ref m) if m.contains("no runnable target")));
    assert!(device.shell_commands().is_empty());
}

#[test]
fn test_missing_abi_property_is_fatal_after_three_reads() {
    let obj = create_objdir(true);
    let device = Rc::new(ScriptedDevice::new());
    device.script_property(PROP_CPU_ABI, &[""]);

    let opts = options(obj.path(), |c| c.harness.setup = false);
    let mut harness = RemoteHarness::new(opts, session(&device));
    let err = harness.prepare().unwrap_err();

    assert!(matches!(err, Error::Provisioning(ref m) if m.contains(PROP_CPU_ABI)));
    assert_eq!(device.property_reads(PROP_CPU_ABI), 3);
    assert!(harness.selected_abi().is_none());
}

#[test]
fn test_crash_is_reported_and_minidumps_emptied() {
    let obj = create_objdir(true);
    let device = arm_device();
    let test_list = tests(obj.path(), &["dom/test_a.js", "netwerk/unit/test_c.js"]);

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    harness.prepare().unwrap();
    harness.register_tests(&test_list).unwrap();
    assert_eq!(harness.translator().len(), 2);

    device.add_file(&format!("{}/0f1e.dmp", REMOTE_MINIDUMPS), b"MDMP");
    let summary = harness.run_tests(&test_list).unwrap();

    assert_eq!(summary.results[0].outcome, TestOutcome::Crashed);
    assert_eq!(summary.results[1].outcome, TestOutcome::Passed);
    assert!(device.dir_exists(REMOTE_MINIDUMPS));
    assert!(device.files_under(REMOTE_MINIDUMPS).is_empty());
}

#[test]
fn test_no_setup_reuses_prepared_device() {
    let obj = create_objdir(false);
    let device = arm_device();

    let opts = options(obj.path(), |c| c.harness.setup = false);
    let mut harness = RemoteHarness::new(opts, session(&device));
    let summary = harness
        .run(&tests(obj.path(), &["dom/test_a.js"]))
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert!(!device
        .calls()
        .iter()
        .any(|c| matches!(c, DeviceCall::Push { remote, .. } if remote.starts_with(REMOTE_BIN))));
    assert!(!device.file_exists(&format!("{}/xpcw", REMOTE_BIN)));
    assert!(device.dir_exists(REMOTE_MINIDUMPS));
}

#[test]
fn test_ports_forwarded_once_and_prefs_deployed() {
    let obj = create_objdir(true);
    let device = arm_device();
    let opts = options(obj.path(), |c| {
        c.env
            .insert("MOZHTTP2_PORT".to_string(), serde_yaml::Value::from(8443));
        c.prefs
            .insert("network.proxy.type".to_string(), serde_yaml::Value::from(0));
    });

    let mut harness = RemoteHarness::new(opts, session(&device));
    let test_list = tests(obj.path(), &["dom/test_a.js"]);
    harness.prepare().unwrap();
    harness.register_tests(&test_list).unwrap();
    harness.register_tests(&test_list).unwrap();

    assert_eq!(
        device.reversed(),
        vec![("tcp:8443".to_string(), "tcp:8443".to_string())]
    );
    let prefs = device
        .file_contents("/data/local/tmp/test_root/xpc/user.js")
        .unwrap();
    assert_eq!(prefs, b"user_pref(\"network.proxy.type\", 0);\n");

    harness.run_tests(&test_list).unwrap();
    let commands = device.shell_commands();
    assert!(commands[0].contains("_PREFS_FILE"));
}

#[test]
fn test_device_loss_aborts_run() {
    let obj = create_objdir(true);
    let device = arm_device();
    device.script_shell(ShellScript::Lost("device offline".to_string()));

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    let err = harness
        .run(&tests(obj.path(), &["dom/test_a.js", "dom/test_b.js"]))
        .unwrap_err();

    assert!(err.is_device_lost());
    assert_eq!(device.shell_commands().len(), 1);
}

#[test]
fn test_unexpected_launch_error_fails_only_that_test() {
    let obj = create_objdir(true);
    let device = arm_device();
    device.script_shell(ShellScript::Fail("protocol fault".to_string()));

    let mut harness = RemoteHarness::new(options(obj.path(), |_| {}), session(&device));
    let summary = harness
        .run(&tests(obj.path(), &["dom/test_a.js", "dom/test_b.js"]))
        .unwrap();

    assert_eq!(
        summary.results[0].outcome,
        TestOutcome::Failed { exit_code: -1 }
    );
    assert_eq!(summary.results[1].outcome, TestOutcome::Passed);
    assert_eq!(summary.exit_code(), 1);
}
