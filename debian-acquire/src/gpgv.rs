// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The gpgv acquire method worker.

Verification is delegated to an external `gpgv` binary with its machine
status stream on file descriptor 3. Status lines are sorted into four
signer lists; the acquisition succeeds when at least one good signature
exists and no bad one does, so a file signed by several keys of which some
are simply unknown still verifies.
*/

use {
    crate::{
        config::MethodConfig,
        error::Result,
        protocol::{FetchItem, FetchResult, Message, MethodReader, MethodWriter},
    },
    log::debug,
    std::{
        fs,
        io::{self, BufRead, BufReader, Write},
        os::unix::{
            io::{AsRawFd, FromRawFd, OwnedFd},
            process::CommandExt,
        },
        path::Path,
        process::{Command, Stdio},
    },
};

const STATUS_PREFIX: &str = "[GNUPG:] ";

/// Signers sorted by what gpgv said about them. A worthless signature is
/// syntactically fine but expired or revoked.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct SignerLists {
    pub good: Vec<String>,
    pub bad: Vec<String>,
    pub worthless: Vec<String>,
    pub no_pub_key: Vec<String>,
}

/// Match one status token exactly, returning the line sans the
/// `[GNUPG:] ` prefix. The token must be followed by a space or the end of
/// the line so that e.g. `GOODSIGX` cannot alias `GOODSIG`.
fn status_payload<'a>(line: &'a str, token: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(STATUS_PREFIX)?;
    let after = rest.strip_prefix(token)?;
    if !after.is_empty() && !after.starts_with(' ') {
        return None;
    }
    Some(rest)
}

/// Sort one helper status line into the lists. Non-status lines and
/// unhandled status tokens are ignored.
pub fn record_status_line(line: &str, lists: &mut SignerLists) {
    if let Some(rest) = status_payload(line, "GOODSIG") {
        // Keep only the hex key ID; the rest of the line is the uid.
        let key: String = rest["GOODSIG".len()..]
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        lists.good.push(key);
    } else if let Some(rest) = status_payload(line, "BADSIG") {
        lists.bad.push(rest.to_string());
    } else if let Some(rest) = status_payload(line, "NODATA") {
        lists.bad.push(rest.to_string());
    } else if let Some(rest) = status_payload(line, "NO_PUBKEY") {
        lists.no_pub_key.push(rest.to_string());
    } else if let Some(rest) = status_payload(line, "KEYEXPIRED") {
        lists.worthless.push(rest.to_string());
    } else if let Some(rest) = status_payload(line, "REVKEYSIG") {
        lists.worthless.push(rest.to_string());
    }
}

/// Run the helper over a detached signature and its payload, classifying
/// everything it reports.
///
/// All failure modes, from a missing helper binary to bad signatures,
/// come back as the status string; `None` means gpgv exited cleanly with
/// at least one good signature recorded.
pub fn verify_signers(
    config: &MethodConfig,
    signature: &Path,
    data: &Path,
    key_ref: Option<&str>,
) -> (SignerLists, Option<String>) {
    let mut lists = SignerLists::default();
    let verbose = config.find_bool("Debug::Acquire::gpgv", false);
    let gpgv = config.find("Dir::Bin::gpgv").unwrap_or("gpgv");

    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe(2) writing into a stack array of the right size.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return (lists, Some("Couldn't create pipe".to_string()));
    }
    // SAFETY: both descriptors are freshly created and owned only here.
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    let mut command = Command::new(gpgv);
    command.arg("--status-fd").arg("3");
    if let Some(key) = key_ref {
        command.arg("--keyring").arg(key);
    }
    command.arg(signature).arg(data);
    command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(if verbose {
        Stdio::inherit()
    } else {
        Stdio::null()
    });

    let status_fd = write_end.as_raw_fd();
    // SAFETY: dup2 is async-signal-safe and the descriptor stays open
    // across the fork because it carries no close-on-exec flag.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(status_fd, 3) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return (
                lists,
                Some("Could not execute 'gpgv' to verify signature (is gpgv installed?)".to_string()),
            );
        }
        Err(e) => return (lists, Some(format!("Couldn't spawn new process: {}", e))),
    };
    drop(write_end);

    let reader = BufReader::new(fs::File::from(read_end));
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if verbose {
            debug!("read: {}", line);
        }
        record_status_line(&line, &mut lists);
    }

    let status = match child.wait() {
        Ok(status) => status,
        Err(e) => return (lists, Some(format!("Couldn't wait for gpgv: {}", e))),
    };
    if verbose {
        debug!("gpgv exited with status {:?}", status.code());
    }

    let status = match status.code() {
        Some(0) => {
            if lists.good.is_empty() {
                Some(
                    "Internal error: Good signature, but could not determine key fingerprint?!"
                        .to_string(),
                )
            } else {
                None
            }
        }
        Some(1) => Some("At least one invalid signature was encountered.".to_string()),
        Some(111) => {
            Some("Could not execute 'gpgv' to verify signature (is gpgv installed?)".to_string())
        }
        Some(112) => Some(
            "Clearsigned file isn't valid, got 'NODATA' (does the network require authentication?)"
                .to_string(),
        ),
        _ => Some("Unknown error executing gpgv".to_string()),
    };

    (lists, status)
}

/// Apply the acquisition trust policy.
///
/// Fatal when no good signature exists or any bad one does; good
/// signatures mixed with unknown keys pass. On success returns the signer
/// lines to report upward: good, bad, then unknown-key, order preserved
/// within each group.
pub fn check_signers(
    lists: &SignerLists,
    status: Option<String>,
) -> std::result::Result<Vec<String>, String> {
    if lists.good.is_empty() || !lists.bad.is_empty() || !lists.no_pub_key.is_empty() {
        let mut errmsg = String::new();
        if lists.bad.is_empty() && lists.worthless.is_empty() && lists.no_pub_key.is_empty() {
            // Nothing classified; the helper status is all we have.
            errmsg = status.unwrap_or_default();
        } else {
            if !lists.bad.is_empty() {
                errmsg.push_str("The following signatures were invalid:\n");
                for signer in &lists.bad {
                    errmsg.push_str(signer);
                    errmsg.push('\n');
                }
            }
            if !lists.worthless.is_empty() {
                errmsg.push_str("The following signatures were invalid:\n");
                for signer in &lists.worthless {
                    errmsg.push_str(signer);
                    errmsg.push('\n');
                }
            }
            if !lists.no_pub_key.is_empty() {
                errmsg.push_str(
                    "The following signatures couldn't be verified because the public key is not available:\n",
                );
                for signer in &lists.no_pub_key {
                    errmsg.push_str(signer);
                    errmsg.push('\n');
                }
            }
        }

        if lists.good.is_empty() || !lists.bad.is_empty() {
            return Err(errmsg);
        }
    }

    Ok(lists
        .good
        .iter()
        .chain(&lists.bad)
        .chain(&lists.no_pub_key)
        .cloned()
        .collect())
}

/// The gpgv worker: a blocking loop over the control channel.
pub struct GpgvWorker<R, W> {
    reader: MethodReader<R>,
    writer: MethodWriter<W>,
    config: MethodConfig,
}

impl<R: BufRead, W: Write> GpgvWorker<R, W> {
    pub fn new(control: R, output: W) -> Self {
        Self {
            reader: MethodReader::new(control),
            writer: MethodWriter::new(output),
            config: MethodConfig::default(),
        }
    }

    /// Serve verification requests until the control channel closes.
    ///
    /// Returns the process exit code.
    pub fn run(&mut self) -> Result<i32> {
        self.writer.send(&Message::capabilities("1.0", true, true))?;

        while let Some(message) = self.reader.next_message()? {
            match message.code() {
                600 => {
                    let item = FetchItem::from_message(&message)?;
                    self.acquire(&item)?;
                }
                601 => self.config.merge_message(&message),
                code => debug!("ignoring message code {}", code),
            }
        }

        Ok(0)
    }

    fn acquire(&mut self, item: &FetchItem) -> Result<()> {
        // gpgv URIs carry bare paths; a host component, when present, is
        // really the first path segment of a relative path.
        let signature = format!(
            "{}{}",
            item.uri.host_str().unwrap_or_default(),
            item.uri.path()
        );

        let mut res = FetchResult::new(item.uri.clone(), item.destination.clone());
        self.writer.send(&Message::uri_start(&res))?;

        let (lists, status) = verify_signers(
            &self.config,
            Path::new(&signature),
            &item.destination,
            item.signed_by.as_deref(),
        );

        match check_signers(&lists, status) {
            Ok(signers) => {
                debug!("gpgv succeeded");
                res.signers = signers;
                self.writer.send(&Message::uri_done(&res))?;
            }
            Err(text) => self.writer.send(&Message::uri_failure(&item.uri, text))?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::os::unix::fs::PermissionsExt};

    fn classify(lines: &[&str]) -> SignerLists {
        let mut lists = SignerLists::default();
        for line in lines {
            record_status_line(line, &mut lists);
        }
        lists
    }

    #[test]
    fn test_goodsig_keeps_hex_id_only() {
        let lists = classify(&["[GNUPG:] GOODSIG AAAA OtherJunk"]);
        assert_eq!(lists.good, vec!["AAAA"]);
    }

    #[test]
    fn test_classification_routing() {
        let lists = classify(&[
            "[GNUPG:] BADSIG CCCC Somebody",
            "[GNUPG:] NODATA 1",
            "[GNUPG:] NO_PUBKEY BBBB",
            "[GNUPG:] KEYEXPIRED 1234",
            "[GNUPG:] REVKEYSIG DDDD Somebody",
            "[GNUPG:] SIG_ID abc 2021-01-01 1609459200",
            "gpgv: Signature made Thu Jan  1 00:00:05 1970",
        ]);
        assert_eq!(lists.bad, vec!["BADSIG CCCC Somebody", "NODATA 1"]);
        assert_eq!(lists.no_pub_key, vec!["NO_PUBKEY BBBB"]);
        assert_eq!(
            lists.worthless,
            vec!["KEYEXPIRED 1234", "REVKEYSIG DDDD Somebody"]
        );
        assert!(lists.good.is_empty());
    }

    #[test]
    fn test_token_must_end_at_word_boundary() {
        let lists = classify(&["[GNUPG:] GOODSIGX AAAA", "[GNUPG:] BADSIGS CCCC"]);
        assert_eq!(lists, SignerLists::default());
    }

    #[test]
    fn test_policy_good_with_unknown_keys_passes() {
        let mut lists = SignerLists::default();
        lists.good.push("AAAA".to_string());
        lists.no_pub_key.push("NO_PUBKEY BBBB".to_string());

        let signers = check_signers(&lists, None).unwrap();
        assert_eq!(signers, vec!["AAAA", "NO_PUBKEY BBBB"]);
    }

    #[test]
    fn test_policy_bad_signature_is_fatal() {
        let mut lists = SignerLists::default();
        lists.good.push("AAAA".to_string());
        lists.bad.push("BADSIG CCCC Somebody".to_string());

        let err = check_signers(&lists, Some("status".to_string())).unwrap_err();
        assert!(err.contains("The following signatures were invalid"));
        assert!(err.contains("CCCC"));
    }

    #[test]
    fn test_policy_no_signers_uses_helper_status() {
        let lists = SignerLists::default();
        let err = check_signers(&lists, Some("Unknown error executing gpgv".to_string()))
            .unwrap_err();
        assert_eq!(err, "Unknown error executing gpgv");
    }

    #[test]
    fn test_policy_worthless_only_still_passes() {
        // Expired signatures alongside a good one neither fail the check
        // nor appear in the reported signers.
        let mut lists = SignerLists::default();
        lists.good.push("AAAA".to_string());
        lists.worthless.push("KEYEXPIRED 1".to_string());

        assert_eq!(check_signers(&lists, None).unwrap(), vec!["AAAA"]);
    }

    /// Write a fake helper that prints canned status lines on fd 3.
    fn fake_helper(dir: &Path, status_lines: &[&str], exit_code: i32) -> std::path::PathBuf {
        let path = dir.join("fake-gpgv");
        let mut script = String::from("#!/bin/sh\n");
        for line in status_lines {
            script.push_str(&format!("echo '{}' >&3\n", line));
        }
        script.push_str(&format!("exit {}\n", exit_code));
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_verify_reads_status_fd() {
        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(
            dir.path(),
            &[
                "[GNUPG:] GOODSIG AAAA Test Key <test@example.org>",
                "[GNUPG:] NO_PUBKEY BBBB",
            ],
            0,
        );
        let mut config = MethodConfig::default();
        config.set("Dir::Bin::gpgv", helper.display());

        let (lists, status) = verify_signers(
            &config,
            Path::new("/nonexistent/sig"),
            Path::new("/nonexistent/data"),
            None,
        );
        assert_eq!(status, None);
        assert_eq!(lists.good, vec!["AAAA"]);
        assert_eq!(lists.no_pub_key, vec!["NO_PUBKEY BBBB"]);
    }

    #[test]
    fn test_verify_maps_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(dir.path(), &["[GNUPG:] BADSIG CCCC Somebody"], 1);
        let mut config = MethodConfig::default();
        config.set("Dir::Bin::gpgv", helper.display());

        let (lists, status) = verify_signers(
            &config,
            Path::new("/nonexistent/sig"),
            Path::new("/nonexistent/data"),
            None,
        );
        assert_eq!(lists.bad, vec!["BADSIG CCCC Somebody"]);
        assert_eq!(
            status.as_deref(),
            Some("At least one invalid signature was encountered.")
        );
    }

    #[test]
    fn test_verify_missing_helper() {
        let mut config = MethodConfig::default();
        config.set("Dir::Bin::gpgv", "/nonexistent/gpgv-binary");

        let (lists, status) =
            verify_signers(&config, Path::new("/s"), Path::new("/d"), None);
        assert_eq!(lists, SignerLists::default());
        assert!(status.unwrap().contains("is gpgv installed?"));
    }

    #[test]
    fn test_worker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(dir.path(), &["[GNUPG:] GOODSIG AAAA Test Key"], 0);

        let input = format!(
            "601 Configuration\n\
             Config-Item: Dir::Bin::gpgv={}\n\
             \n\
             600 URI Acquire\n\
             URI: gpgv:/nonexistent/InRelease\n\
             Filename: /nonexistent/InRelease.data\n\
             \n",
            helper.display()
        );
        let mut output = Vec::new();
        let mut worker = GpgvWorker::new(input.as_bytes(), &mut output);
        assert_eq!(worker.run().unwrap(), 0);

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("100 Capabilities\n"));
        assert!(output.contains("200 URI Start\n"));
        assert!(output.contains("201 URI Done\n"));
        assert!(output.contains("GPGVOutput: AAAA\n"));
    }
}
