// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Abort handling for in-progress downloads.

When the parent kills a worker mid-transfer the partial destination file
is kept, stamped with the server-advertised date. A later run can then
send a valid `If-Range` and resume instead of starting over.
*/

use {
    chrono::{DateTime, Utc},
    filetime::FileTime,
    log::debug,
    std::{
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
    tokio::signal::unix::{signal, SignalKind},
};

struct AbortState {
    path: PathBuf,
    date: DateTime<Utc>,
}

/// Handle on the currently open destination, shared with the signal task.
///
/// Armed when a destination opens for writing, cleared when it closes
/// normally; store-once/clear rather than a pile of globals.
#[derive(Clone, Default)]
pub struct AbortHandle {
    state: Arc<Mutex<Option<AbortState>>>,
}

impl AbortHandle {
    /// Record the open destination and the date to stamp on abort.
    pub fn arm(&self, path: &Path, date: DateTime<Utc>) {
        *self.state.lock().expect("abort state lock") = Some(AbortState {
            path: path.to_path_buf(),
            date,
        });
    }

    /// The destination closed normally; nothing to preserve anymore.
    pub fn disarm(&self) {
        *self.state.lock().expect("abort state lock") = None;
    }

    /// Stamp the armed destination with its server date, if any.
    pub fn stamp(&self) {
        if let Some(state) = self.state.lock().expect("abort state lock").take() {
            let stamp = FileTime::from_unix_time(state.date.timestamp(), 0);
            if let Err(e) = filetime::set_file_times(&state.path, stamp, stamp) {
                debug!("could not stamp {}: {}", state.path.display(), e);
            }
        }
    }
}

/// Exit on SIGTERM/SIGINT, preserving resume state for the armed
/// destination first.
pub fn install(handle: &AbortHandle) {
    let handle = handle.clone();
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return,
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(int) => int,
            Err(_) => return,
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        handle.stamp();
        std::process::exit(100);
    });
}

#[cfg(test)]
mod tests {
    use {super::*, crate::timefmt, std::fs};

    #[test]
    fn test_stamp_sets_server_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial");
        fs::write(&path, b"some bytes").unwrap();

        let handle = AbortHandle::default();
        handle.arm(&path, timefmt::from_unix(5).unwrap());
        handle.stamp();

        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(
            mtime,
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(5)
        );
        assert_eq!(fs::read(&path).unwrap(), b"some bytes");
    }

    #[test]
    fn test_disarmed_stamp_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done");
        fs::write(&path, b"x").unwrap();

        let handle = AbortHandle::default();
        handle.arm(&path, timefmt::from_unix(5).unwrap());
        handle.disarm();
        handle.stamp();

        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert_ne!(
            mtime,
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(5)
        );
    }
}
