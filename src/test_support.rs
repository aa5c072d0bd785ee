//! Fixture builders shared by the unit tests.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::fetch::HttpClient;

pub const CALENDAR: &str = "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
W,1,1,1,1,1,0,0,20150927,20160305\n\
S,0,0,0,0,0,1,0,20151003,20160227\n";

pub const CALENDAR_DATES: &str = "service_id,date,exception_type\nW,20151126,2\n";

pub const FEED_INFO: &str = "feed_publisher_name,feed_publisher_url,feed_lang,feed_start_date,feed_end_date,feed_version\n\
TriMet,http://trimet.org,en,20150927,20160305,20150927-20151006-0140\n";

pub const STOPS: &str = "stop_id,stop_name,stop_lat,stop_lon\n2,A Ave & Chandler,45.420595,-122.675676\n3,A Ave & Second St,45.419386,-122.665341\n";

pub const TRIPS: &str = "route_id,service_id,trip_id\n90,W,5001\n90,S,5002\n";

/// The tables of the reference TriMet-like feed.
pub fn trimet_tables() -> Vec<(&'static str, String)> {
    vec![
        ("calendar.txt", CALENDAR.to_string()),
        ("calendar_dates.txt", CALENDAR_DATES.to_string()),
        ("feed_info.txt", FEED_INFO.to_string()),
        ("stops.txt", STOPS.to_string()),
        ("trips.txt", TRIPS.to_string()),
    ]
}

/// Writes a zip with the given `(entry name, contents)` pairs.
pub fn write_zip<S: AsRef<str>>(dir: &Path, name: &str, entries: &[(&str, S)]) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (entry, contents) in entries {
        zip.start_file(*entry, options).unwrap();
        zip.write_all(contents.as_ref().as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    path
}

pub fn write_trimet(dir: &Path, name: &str) -> PathBuf {
    write_zip(dir, name, &trimet_tables())
}

/// Returns the TriMet tables with `table` replaced by `contents`.
pub fn trimet_with(table: &'static str, contents: &str) -> Vec<(&'static str, String)> {
    trimet_tables()
        .into_iter()
        .map(|(name, body)| {
            if name == table {
                (name, contents.to_string())
            } else {
                (name, body)
            }
        })
        .collect()
}

/// In-memory remote that answers GETs from a URL map and honours
/// `If-None-Match`. Counts full body transfers.
#[derive(Default)]
pub struct FakeRemote {
    resources: Mutex<HashMap<String, (Vec<u8>, Option<String>)>>,
    transfers: AtomicUsize,
    last: Mutex<Option<(String, HeaderMap)>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, url: &str, body: Vec<u8>, etag: Option<&str>) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), (body, etag.map(str::to_string)));
    }

    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn last_request_headers(&self) -> HeaderMap {
        self.last.lock().unwrap().clone().map(|(_, h)| h).unwrap_or_default()
    }

    pub fn last_request_url(&self) -> Option<String> {
        self.last.lock().unwrap().clone().map(|(u, _)| u)
    }
}

#[async_trait]
impl HttpClient for FakeRemote {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let mut key = req.url().clone();
        key.set_query(None);
        *self.last.lock().unwrap() = Some((req.url().to_string(), req.headers().clone()));

        let found = self.resources.lock().unwrap().get(key.as_str()).cloned();
        let response = match found {
            None => http::Response::builder().status(404).body(Vec::new()).unwrap(),
            Some((body, etag)) => {
                let not_modified = etag.is_some()
                    && req
                        .headers()
                        .get(reqwest::header::IF_NONE_MATCH)
                        .and_then(|v| v.to_str().ok())
                        == etag.as_deref();
                if not_modified {
                    http::Response::builder().status(304).body(Vec::new()).unwrap()
                } else {
                    self.transfers.fetch_add(1, Ordering::SeqCst);
                    let mut builder = http::Response::builder().status(200);
                    if let Some(tag) = etag {
                        builder = builder.header("ETag", tag);
                    }
                    builder.body(body).unwrap()
                }
            }
        };
        Ok(reqwest::Response::from(response))
    }
}
