#![cfg(feature = "age")]

mod common;

use common::{age_identity, sops_cmd, workspace, write_file};
use predicates::prelude::*;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::Path;

const SECRETS: &str = r#"{
	"user": "alice",
	"password": "hunter2",
	"db": {
		"port": 5432,
		"host_unencrypted": "db.internal"
	},
	"tokens": [
		"a",
		"b"
	]
}
"#;

fn read_json(path: &Path) -> JsonValue {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

fn encrypt_in_place(home: &Path, file: &Path, recipient: &str) {
    sops_cmd(home, None)
        .args(["encrypt", "-i", "--age", recipient])
        .arg(file)
        .assert()
        .success();
}

#[test]
fn test_encrypt_writes_envelopes_and_metadata() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());

    let output = sops_cmd(home.path(), None)
        .args(["encrypt", "--age", &id.recipient])
        .arg(&file)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: JsonValue = serde_json::from_slice(&output).unwrap();
    assert!(json["user"].as_str().unwrap().starts_with("ENC[AES256_GCM,data:"));
    assert!(json["db"]["port"].as_str().unwrap().ends_with("type:int]"));
    assert_eq!(json["db"]["host_unencrypted"], "db.internal");
    assert_eq!(json["sops"]["age"][0]["recipient"], id.recipient.as_str());
    assert_eq!(json["sops"]["unencrypted_suffix"], "_unencrypted");
    assert_eq!(json["sops"]["version"], "3.9.0");
    assert!(json["sops"]["mac"].as_str().unwrap().starts_with("ENC[AES256_GCM,"));

    // Without -i the source file is untouched.
    assert_eq!(fs::read_to_string(&file).unwrap(), SECRETS);
}

#[test]
fn test_decrypt_restores_the_document() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);

    sops_cmd(home.path(), Some(&id.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .success()
        .stdout(SECRETS);
}

#[test]
fn test_decrypt_extracts_values() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);

    sops_cmd(home.path(), Some(&id.secret))
        .args(["decrypt", "--extract", r#"["password"]"#])
        .arg(&file)
        .assert()
        .success()
        .stdout("hunter2");

    sops_cmd(home.path(), Some(&id.secret))
        .args(["decrypt", "--extract", r#"["db"]["port"]"#])
        .arg(&file)
        .assert()
        .success()
        .stdout("5432\n");

    sops_cmd(home.path(), Some(&id.secret))
        .args(["decrypt", "--extract", "['db']"])
        .arg(&file)
        .assert()
        .success()
        .stdout("{\n\t\"port\": 5432,\n\t\"host_unencrypted\": \"db.internal\"\n}\n");

    sops_cmd(home.path(), Some(&id.secret))
        .args(["decrypt", "--extract", r#"["missing"]"#])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_decrypt_without_identity_reports_every_key() {
    let home = workspace();
    let id = age_identity();
    let other = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);

    sops_cmd(home.path(), Some(&other.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error getting data key"))
        .stderr(predicate::str::contains(format!("{}: FAILED", id.recipient)));
}

#[test]
fn test_tampering_is_detected_by_the_mac() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);

    let mut json = read_json(&file);
    json["db"]["host_unencrypted"] = JsonValue::from("evil.example");
    fs::write(&file, serde_json::to_vec_pretty(&json).unwrap()).unwrap();

    sops_cmd(home.path(), Some(&id.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("MAC mismatch"));

    sops_cmd(home.path(), Some(&id.secret))
        .args(["decrypt", "--ignore-mac", "--extract", r#"["user"]"#])
        .arg(&file)
        .assert()
        .success()
        .stdout("alice");
}

#[test]
fn test_swapped_ciphertexts_fail_authentication() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);

    let mut json = read_json(&file);
    let user = json["user"].clone();
    json["user"] = json["password"].clone();
    json["password"] = user;
    fs::write(&file, serde_json::to_vec(&json).unwrap()).unwrap();

    sops_cmd(home.path(), Some(&id.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cipher error"));
}

#[test]
fn test_set_and_unset_keep_other_ciphertexts() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);
    let before = read_json(&file);

    sops_cmd(home.path(), Some(&id.secret))
        .args(["set"])
        .arg(&file)
        .args([r#"["api"]["key"]"#, r#""s3cr3t""#])
        .assert()
        .success();

    let after = read_json(&file);
    assert_eq!(after["user"], before["user"]);
    assert_eq!(after["db"]["port"], before["db"]["port"]);
    assert!(after["api"]["key"].as_str().unwrap().starts_with("ENC["));

    sops_cmd(home.path(), Some(&id.secret))
        .args(["decrypt", "--extract", r#"["api"]["key"]"#])
        .arg(&file)
        .assert()
        .success()
        .stdout("s3cr3t");

    sops_cmd(home.path(), Some(&id.secret))
        .arg("unset")
        .arg(&file)
        .arg(r#"["tokens"][0]"#)
        .assert()
        .success();

    sops_cmd(home.path(), Some(&id.secret))
        .args(["decrypt", "--extract", r#"["tokens"]"#])
        .arg(&file)
        .assert()
        .success()
        .stdout("[\n\t\"b\"\n]\n");
}

#[test]
fn test_set_rejects_invalid_json() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);
    let before = fs::read(&file).unwrap();

    sops_cmd(home.path(), Some(&id.secret))
        .arg("set")
        .arg(&file)
        .args([r#"["user"]"#, "not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not valid JSON"));
    assert_eq!(fs::read(&file).unwrap(), before);
}

#[test]
fn test_set_refuses_the_metadata_key() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);
    let before = fs::read(&file).unwrap();

    sops_cmd(home.path(), Some(&id.secret))
        .arg("set")
        .arg(&file)
        .args([r#"["sops"]"#, r#""x""#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is reserved for metadata"));
    assert_eq!(fs::read(&file).unwrap(), before);

    sops_cmd(home.path(), Some(&id.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .success();
}

#[test]
fn test_rotate_adds_a_recipient_and_changes_every_value() {
    let home = workspace();
    let first = age_identity();
    let second = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &first.recipient);
    let before = read_json(&file);

    sops_cmd(home.path(), Some(&first.secret))
        .args(["rotate", "-i", "--add-age", &second.recipient])
        .arg(&file)
        .assert()
        .success();

    let after = read_json(&file);
    assert_ne!(after["user"], before["user"]);
    assert_ne!(after["password"], before["password"]);
    assert_eq!(after["sops"]["age"].as_array().unwrap().len(), 2);

    sops_cmd(home.path(), Some(&second.secret))
        .args(["decrypt", "--extract", r#"["password"]"#])
        .arg(&file)
        .assert()
        .success()
        .stdout("hunter2");

    sops_cmd(home.path(), Some(&second.secret))
        .args(["rotate", "-i", "--rm-age", &first.recipient])
        .arg(&file)
        .assert()
        .success();

    sops_cmd(home.path(), Some(&first.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .failure();
}

#[test]
fn test_key_groups_require_the_threshold() {
    let home = workspace();
    let first = age_identity();
    let second = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &first.recipient);

    sops_cmd(home.path(), Some(&first.secret))
        .args(["groups", "add", "--age", &second.recipient])
        .arg(&file)
        .assert()
        .success();

    let json = read_json(&file);
    assert_eq!(json["sops"]["shamir_threshold"], 2);
    assert_eq!(json["sops"]["key_groups"].as_array().unwrap().len(), 2);
    assert!(json["sops"]["age"].is_null());

    sops_cmd(home.path(), Some(&first.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("2 successful groups required, got 1"));

    let both = format!("{}\n{}\n", first.secret, second.secret);
    sops_cmd(home.path(), Some(&both))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .success()
        .stdout(SECRETS);

    sops_cmd(home.path(), Some(&both))
        .args(["groups", "delete"])
        .arg(&file)
        .arg("1")
        .assert()
        .success();

    sops_cmd(home.path(), Some(&first.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .success()
        .stdout(SECRETS);
}

#[test]
fn test_binary_files_round_trip() {
    let home = workspace();
    let id = age_identity();
    let contents = b"API_KEY=abc123\nDEBUG=false\n";
    let file = write_file(home.path(), "app.env", contents);
    encrypt_in_place(home.path(), &file, &id.recipient);

    let json = read_json(&file);
    assert!(json["data"].as_str().unwrap().starts_with("ENC[AES256_GCM,"));
    assert!(json["sops"].is_object());

    sops_cmd(home.path(), Some(&id.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::eq(&contents[..]));
}

#[test]
fn test_encrypt_rejects_bad_input() {
    let home = workspace();
    let id = age_identity();

    let file = write_file(home.path(), "plain.json", br#"{"a": "b"}"#);
    sops_cmd(home.path(), None)
        .arg("encrypt")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no master keys given"));

    let reserved = write_file(home.path(), "reserved.json", br#"{"sops": {}}"#);
    sops_cmd(home.path(), None)
        .args(["encrypt", "--age", &id.recipient])
        .arg(&reserved)
        .assert()
        .failure()
        .stderr(predicate::str::contains("reserved"));

    sops_cmd(home.path(), None)
        .args(["encrypt", "--age", "age1bogus"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid age recipient"));
}

#[test]
fn test_encrypted_regex_limits_what_is_encrypted() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());

    sops_cmd(home.path(), None)
        .args(["encrypt", "-i", "--age", &id.recipient, "--encrypted-regex", "^pass"])
        .arg(&file)
        .assert()
        .success();

    let json = read_json(&file);
    assert_eq!(json["user"], "alice");
    assert!(json["password"].as_str().unwrap().starts_with("ENC["));
    assert_eq!(json["sops"]["encrypted_regex"], "^pass");
    assert!(json["sops"].get("unencrypted_suffix").is_none());

    sops_cmd(home.path(), Some(&id.secret))
        .arg("decrypt")
        .arg(&file)
        .assert()
        .success()
        .stdout(SECRETS);
}

#[test]
fn test_settings_file_errors_are_reported() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    let config = write_file(
        home.path(),
        "sops.toml",
        b"decryption_order = [\"age\", \"floppy\"]\n",
    );

    sops_cmd(home.path(), None)
        .arg("--config")
        .arg(&config)
        .args(["encrypt", "--age", &id.recipient])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_age_key_file_from_settings() {
    let home = workspace();
    let id = age_identity();
    let file = write_file(home.path(), "secrets.json", SECRETS.as_bytes());
    encrypt_in_place(home.path(), &file, &id.recipient);

    let keys = write_file(home.path(), "keys.txt", format!("{}\n", id.secret).as_bytes());
    let config = write_file(
        home.path(),
        "sops.toml",
        format!("[age]\nkey_file = {:?}\n", keys.display().to_string()).as_bytes(),
    );

    sops_cmd(home.path(), None)
        .arg("--config")
        .arg(&config)
        .args(["decrypt", "--extract", r#"["user"]"#])
        .arg(&file)
        .assert()
        .success()
        .stdout("alice");
}
