// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! HTTP request formatting. */

use {
    crate::{http::server::ServerState, protocol::FetchItem, timefmt},
    chrono::{DateTime, Utc},
    std::{fs, time::SystemTime},
};

/// Build the GET request for an item, taking the local file state into
/// account: a non-empty destination turns into a one-byte-overlap Range
/// plus If-Range pair, a known last-modified time into If-Modified-Since.
pub fn build_request(item: &FetchItem, server: &ServerState) -> String {
    let uri = &item.uri;
    let mut host = uri.host_str().unwrap_or_default().to_string();
    if let Some(port) = uri.port() {
        host.push_str(&format!(":{}", port));
    }

    /* The keep-alive header is included only for direct requests, to tweak
       old HTTP/1.0 servers that support keep-alive but not the HTTP/1.1
       automatic variant. HTTP/1.0 proxies do not filter the header out, so
       through a proxy it stays suppressed and the proxy decides. */
    let mut req = if server.proxy.is_none() {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n",
            uri.path(),
            host
        )
    } else {
        format!("GET {} HTTP/1.1\r\nHost: {}\r\n", uri, host)
    };

    match fs::metadata(&item.destination) {
        Ok(meta) if meta.len() > 0 => {
            /* A partial file exists. The range overlaps the last byte on
               disk so a server that no longer has this entity can answer
               200 with a full body instead of 416. */
            let mtime: DateTime<Utc> = meta
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH)
                .into();
            req.push_str(&format!(
                "Range: bytes={}-\r\nIf-Range: {}\r\n",
                meta.len() - 1,
                timefmt::rfc1123(mtime)
            ));
        }
        _ => {
            if let Some(last_modified) = item.last_modified {
                req.push_str(&format!(
                    "If-Modified-Since: {}\r\n",
                    timefmt::rfc1123(last_modified)
                ));
            }
        }
    }

    req.push_str("User-Agent: Debian APT-HTTP/1.3\r\n\r\n");
    req
}

#[cfg(test)]
mod tests {
    use {super::*, crate::timefmt, std::io::Write, url::Url};

    fn item(uri: &str, destination: &std::path::Path) -> FetchItem {
        FetchItem {
            uri: Url::parse(uri).unwrap(),
            destination: destination.to_path_buf(),
            last_modified: None,
            signed_by: None,
        }
    }

    #[test]
    fn test_plain_get() {
        let dir = tempfile::tempdir().unwrap();
        let item = item(
            "http://ftp.debian.org/debian/dists/stable/Release",
            &dir.path().join("Release"),
        );
        let server = ServerState::new(item.uri.clone());

        let req = build_request(&item, &server);
        assert!(req.starts_with("GET /debian/dists/stable/Release HTTP/1.1\r\n"));
        assert!(req.contains("Host: ftp.debian.org\r\n"));
        assert!(req.contains("Connection: keep-alive\r\n"));
        assert!(!req.contains("Range:"));
        assert!(!req.contains("If-Modified-Since:"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_nondefault_port_in_host() {
        let dir = tempfile::tempdir().unwrap();
        let item = item("http://mirror.example:8080/f", &dir.path().join("f"));
        let server = ServerState::new(item.uri.clone());
        assert!(build_request(&item, &server).contains("Host: mirror.example:8080\r\n"));
    }

    #[test]
    fn test_proxy_uses_absolute_uri() {
        let dir = tempfile::tempdir().unwrap();
        let item = item("http://ftp.debian.org/f", &dir.path().join("f"));
        let mut server = ServerState::new(item.uri.clone());
        server.proxy = Some(Url::parse("http://proxy.example:3128/").unwrap());

        let req = build_request(&item, &server);
        assert!(req.starts_with("GET http://ftp.debian.org/f HTTP/1.1\r\n"));
        assert!(!req.contains("Connection: keep-alive"));
    }

    #[test]
    fn test_if_modified_since() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = item("http://h/f", &dir.path().join("f"));
        item.last_modified = timefmt::from_unix(5);
        let server = ServerState::new(item.uri.clone());

        let req = build_request(&item, &server);
        assert!(req.contains("If-Modified-Since: Thu, 01 Jan 1970 00:00:05 GMT\r\n"));
    }

    #[test]
    fn test_resume_range() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f");
        let mut file = fs::File::create(&dest).unwrap();
        file.write_all(b"helloworld").unwrap();
        drop(file);
        let mtime = filetime::FileTime::from_unix_time(5, 0);
        filetime::set_file_times(&dest, mtime, mtime).unwrap();

        let mut item = item("http://h/f", &dest);
        // Range wins over If-Modified-Since when a partial file exists.
        item.last_modified = timefmt::from_unix(99);
        let server = ServerState::new(item.uri.clone());

        let req = build_request(&item, &server);
        assert!(req.contains("Range: bytes=9-\r\n"));
        assert!(req.contains("If-Range: Thu, 01 Jan 1970 00:00:05 GMT\r\n"));
        assert!(!req.contains("If-Modified-Since:"));
    }
}
