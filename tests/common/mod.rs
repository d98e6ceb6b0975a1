//! Shared fixtures: a fake VM kernel, tar payloads, and a callback capture
//! server. The fake kernel is an executable script standing in for
//! `linux.uml`; it receives the exact argv a real guest would and interprets
//! the `ubdc=` parameter to deliver canned results.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;

use tempfile::TempDir;

use sandboxd::config::Settings;

/// Fork-based tests share one process; run them one at a time.
pub static FORK_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Lay out a sandbox files root whose kernel is the given shell script.
pub fn fake_sandbox_root(kernel_script: &str) -> TempDir {
    let root = tempfile::tempdir().unwrap();
    let kernel = root.path().join("linux.uml");
    fs::write(&kernel, kernel_script).unwrap();
    fs::set_permissions(&kernel, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(root.path().join("rootfs.squashfs"), b"squashfs-stub").unwrap();
    fs::write(root.path().join("initrd.img"), b"initrd-stub").unwrap();
    root
}

/// A kernel that copies a prepared result archive onto its output device.
pub fn kernel_delivering(payload: &std::path::Path) -> String {
    format!(
        "#!/bin/sh\n\
         out=\"\"\n\
         for arg in \"$@\"; do\n\
         \x20\x20case \"$arg\" in\n\
         \x20\x20\x20\x20ubdc=*) out=\"${{arg#ubdc=}}\" ;;\n\
         \x20\x20esac\n\
         done\n\
         cp {} \"$out\"\n\
         exit 0\n",
        payload.display()
    )
}

pub fn settings_for(root: &std::path::Path, timeout: u64) -> Settings {
    Settings {
        timeout,
        max_output_size: 1024 * 1024,
        instance_ram: "64M".to_string(),
        sandbox_files_root: root.to_path_buf(),
        debug_log_file: None,
    }
}

/// Build an in-memory tar with the given entries.
pub fn make_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut bytes);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.finish().unwrap();
    }
    bytes
}

/// One-shot HTTP capture server for the notification callback. Returns the
/// URL to post to and a channel yielding the raw form-encoded body.
pub fn capture_server() -> (String, Receiver<String>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    let (sender, receiver) = mpsc::channel();

    thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length: usize = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())?
            })
            .unwrap_or(0);

        let mut body = buf[header_end + 4..].to_vec();
        while body.len() < content_length {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }
        body.truncate(content_length);

        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let _ = stream.flush();
        let _ = sender.send(String::from_utf8_lossy(&body).into_owned());
    });

    (format!("http://{}/callback", addr), receiver)
}

/// Decode an application/x-www-form-urlencoded body into a field map.
pub fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(name), percent_decode(value))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
