use assert_cmd::Command;
use std::io::Write;

fn rule_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn hftctl() -> Command {
    Command::cargo_bin("hftctl").unwrap()
}

#[test]
fn check_lists_valid_rules() {
    let file = rule_file(
        "# port,destination,via,comment\n\
         8080,127.0.0.1:9090,127.0.0.1,test\n\
         8081,10.0.0.5:443,0.0.0.0,desk, primary\n",
    );

    let output = hftctl().arg("check").arg(file.path()).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(":8080 -> 127.0.0.1:9090"), "stdout: {stdout}");
    assert!(stdout.contains("desk, primary"), "stdout: {stdout}");
    assert!(stdout.contains("2 rule(s) OK."), "stdout: {stdout}");
}

#[test]
fn check_rejects_duplicate_ports() {
    let file = rule_file(
        "8080,127.0.0.1:9090,127.0.0.1,a\n\
         8080,127.0.0.1:9091,127.0.0.1,b\n",
    );

    let output = hftctl().arg("check").arg(file.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("duplicated listening ports: 8080"), "stderr: {stderr}");
}

#[test]
fn check_reports_every_bad_line() {
    let file = rule_file(
        "abc,127.0.0.1:9090,127.0.0.1\n\
         8081,127.0.0.1:9090\n",
    );

    let output = hftctl().arg("check").arg(file.path()).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 1"), "stderr: {stderr}");
    assert!(stderr.contains("line 2"), "stderr: {stderr}");
}

#[test]
fn check_missing_file_fails() {
    let output = hftctl()
        .args(["check", "/nonexistent/hftproxy/rules.txt"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn request_without_proxy_fails() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let output = hftctl()
        .args([
            "request",
            "--target-ip",
            "127.0.0.1",
            "--target-port",
            "9090",
            "--control",
            &format!("127.0.0.1:{port}"),
            "--timeout",
            "2",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot connect"), "stderr: {stderr}");
}
