//! Rekordbox XML library access: parse an exported `DJ_PLAYLISTS` document
//! into generic attribute maps, and render a new document for import.
//!
//! Track attributes are collected as-is into a map so the field mapping
//! drives which ones matter; this module knows the envelope, not the schema.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::Path;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::SyncError;
use crate::table::Value;

/// One `TRACK` element's attribute set, verbatim except `Location`, which
/// is decoded from its `file://localhost` URI form. Rekordbox stores the
/// location without the leading path separator; so does this map — the
/// loader re-prepends it.
#[derive(Debug)]
pub struct XmlTrack {
    attrs: HashMap<String, String>,
}

impl XmlTrack {
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.attrs.get(attr).map(String::as_str)
    }
}

#[derive(Debug)]
pub struct RekordboxXml {
    pub tracks: Vec<XmlTrack>,
}

/// Parse an exported library. The path must already exist; malformed
/// documents and a missing `DJ_PLAYLISTS` root are load errors.
pub fn parse(path: &Path) -> Result<RekordboxXml, SyncError> {
    if path.is_dir() {
        return Err(SyncError::SourceUnavailable(format!(
            "rekordbox XML is a directory: {}",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(SyncError::SourceUnavailable(format!(
            "rekordbox XML not found: {}",
            path.display()
        )));
    }
    let file = fs::File::open(path).map_err(|err| {
        SyncError::SourceUnavailable(format!("cannot open {}: {err}", path.display()))
    })?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut saw_root = false;
    let mut in_collection = false;
    let mut tracks = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"DJ_PLAYLISTS" => saw_root = true,
                b"COLLECTION" => in_collection = true,
                b"TRACK" if in_collection => {
                    let mut attrs = HashMap::new();
                    for attr in e.attributes() {
                        let attr = attr.map_err(|err| {
                            SyncError::Load(format!("malformed TRACK attribute: {err}"))
                        })?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr
                            .unescape_value()
                            .map_err(|err| {
                                SyncError::Load(format!("malformed TRACK attribute: {err}"))
                            })?
                            .into_owned();
                        let value = if key == "Location" {
                            location_to_path(&value)
                        } else {
                            value
                        };
                        attrs.insert(key, value);
                    }
                    tracks.push(XmlTrack { attrs });
                }
                _ => {}
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"COLLECTION" => in_collection = false,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(SyncError::Load(format!(
                    "malformed rekordbox XML {}: {err}",
                    path.display()
                )));
            }
        }
        buf.clear();
    }
    if !saw_root {
        return Err(SyncError::Load(format!(
            "{} is not a rekordbox library (no DJ_PLAYLISTS root)",
            path.display()
        )));
    }
    Ok(RekordboxXml { tracks })
}

/// Decode a `Location` attribute to a filesystem path without its leading
/// separator, mirroring what the export format actually stores.
pub fn location_to_path(location: &str) -> String {
    let rest = location
        .strip_prefix("file://localhost")
        .or_else(|| location.strip_prefix("file://"))
        .unwrap_or(location);
    let decoded = percent_decode_str(rest).decode_utf8_lossy();
    decoded.trim_start_matches('/').to_string()
}

/// Convert a filesystem path (with leading separator) to a Rekordbox
/// Location URI, e.g. `/Music/file name.flac` →
/// `file://localhost/Music/file%20name.flac`.
pub fn path_to_location(file_path: &str) -> String {
    // Encode everything except unreserved chars and path separators.
    const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'_')
        .remove(b'.')
        .remove(b'~')
        .remove(b'/');

    let encoded = utf8_percent_encode(file_path, ENCODE_SET).to_string();
    format!("file://localhost{encoded}")
}

/// Escape special characters for XML attribute values.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// One synthesized track ready for serialization: a path (with leading
/// separator) plus attribute values already in Rekordbox shape.
pub struct OutTrack {
    pub path: String,
    pub attrs: Vec<(String, Value)>,
}

/// Render a complete import document. Empty and null attribute values are
/// omitted, matching what Rekordbox itself writes.
pub fn generate_xml(tracks: &[OutTrack]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(tracks.len() * 512 + 256);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<DJ_PLAYLISTS Version=\"1.0.0\">\n");
    out.push_str("  <PRODUCT Name=\"rekordbox\" Version=\"5.4.3\" Company=\"Pioneer DJ\"/>\n");
    let _ = write!(out, "  <COLLECTION Entries=\"{}\">\n", tracks.len());

    for (i, track) in tracks.iter().enumerate() {
        let _ = write!(
            out,
            "    <TRACK TrackID=\"{}\" Location=\"{}\"",
            i + 1,
            xml_escape(&path_to_location(&track.path))
        );
        for (name, value) in &track.attrs {
            let rendered = value.render();
            if rendered.is_empty() {
                continue;
            }
            let _ = write!(out, " {}=\"{}\"", name, xml_escape(&rendered));
        }
        out.push_str("/>\n");
    }

    out.push_str("  </COLLECTION>\n");
    out.push_str("</DJ_PLAYLISTS>\n");
    out
}

/// Write the import document, creating parent directories if needed.
pub fn write_xml(tracks: &[OutTrack], path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            SyncError::Load(format!("cannot create {}: {err}", parent.display()))
        })?;
    }
    fs::write(path, generate_xml(tracks))
        .map_err(|err| SyncError::Load(format!("cannot write {}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DJ_PLAYLISTS Version="1.0.0">
  <PRODUCT Name="rekordbox" Version="5.4.3" Company="Pioneer DJ"/>
  <COLLECTION Entries="2">
    <TRACK TrackID="1" Name="Archangel" Artist="Burial" Rating="204"
           Location="file://localhost/Music/Burial/01%20Archangel.flac"/>
    <TRACK TrackID="2" Name="Drum &amp; Bass" Artist="Someone" Rating="0"
           Location="file://localhost/Music/Drum%20%26%20Bass/track.mp3"/>
  </COLLECTION>
  <PLAYLISTS>
    <NODE Type="0" Name="ROOT" Count="1">
      <NODE Name="set" Type="1" Entries="1">
        <TRACK Key="1"/>
      </NODE>
    </NODE>
  </PLAYLISTS>
</DJ_PLAYLISTS>
"#;

    fn write_sample(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("library.xml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parse_reads_collection_tracks_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let xml = parse(&path).unwrap();
        // The playlist TRACK reference must not leak into the collection.
        assert_eq!(xml.tracks.len(), 2);
        assert_eq!(xml.tracks[0].get("Name"), Some("Archangel"));
        assert_eq!(xml.tracks[1].get("Name"), Some("Drum & Bass"));
    }

    #[test]
    fn parse_decodes_location_without_leading_slash() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, SAMPLE);
        let xml = parse(&path).unwrap();
        assert_eq!(
            xml.tracks[0].get("Location"),
            Some("Music/Burial/01 Archangel.flac")
        );
        assert_eq!(
            xml.tracks[1].get("Location"),
            Some("Music/Drum & Bass/track.mp3")
        );
    }

    #[test]
    fn parse_missing_file_is_source_unavailable() {
        let err = parse(Path::new("/nonexistent/library.xml")).unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
    }

    #[test]
    fn parse_directory_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse(dir.path()).unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
    }

    #[test]
    fn parse_rejects_non_rekordbox_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, "<?xml version=\"1.0\"?><OTHER/>");
        let err = parse(&path).unwrap_err();
        assert!(matches!(err, SyncError::Load(_)));
    }

    #[test]
    fn parse_rejects_malformed_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(
            &dir,
            "<DJ_PLAYLISTS><COLLECTION><TRACK Name=unquoted/></COLLECTION></DJ_PLAYLISTS>",
        );
        let err = parse(&path).unwrap_err();
        assert!(matches!(err, SyncError::Load(_)));
    }

    #[test]
    fn location_round_trip() {
        let path = "/Music/Drum & Bass/Café.mp3";
        let uri = path_to_location(path);
        assert!(uri.starts_with("file://localhost/Music/Drum%20%26%20Bass/"));
        assert_eq!(format!("/{}", location_to_path(&uri)), path);
    }

    #[test]
    fn xml_escape_covers_special_characters() {
        assert_eq!(xml_escape("a & b"), "a &amp; b");
        assert_eq!(xml_escape("a < b"), "a &lt; b");
        assert_eq!(xml_escape("a \"b\""), "a &quot;b&quot;");
        assert_eq!(xml_escape("it's"), "it&apos;s");
        assert_eq!(xml_escape("plain"), "plain");
    }

    #[test]
    fn generate_xml_structure_and_counts() {
        let tracks = vec![
            OutTrack {
                path: "/Music/a.mp3".to_string(),
                attrs: vec![("Name".to_string(), Value::Text("A".into()))],
            },
            OutTrack {
                path: "/Music/b.mp3".to_string(),
                attrs: vec![("Name".to_string(), Value::Text("B".into()))],
            },
        ];
        let xml = generate_xml(&tracks);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<DJ_PLAYLISTS Version=\"1.0.0\">"));
        assert!(xml.contains("<PRODUCT Name=\"rekordbox\" Version=\"5.4.3\" Company=\"Pioneer DJ\"/>"));
        assert!(xml.contains("<COLLECTION Entries=\"2\">"));
        assert_eq!(xml.matches("<TRACK ").count(), 2);
        assert!(xml.contains("TrackID=\"1\""));
        assert!(xml.contains("TrackID=\"2\""));
    }

    #[test]
    fn generate_xml_omits_empty_values_and_escapes() {
        let tracks = vec![OutTrack {
            path: "/Music/Drum & Bass/x.mp3".to_string(),
            attrs: vec![
                ("Name".to_string(), Value::Text("\"great\" <track>".into())),
                ("Comments".to_string(), Value::Text(String::new())),
                ("Rating".to_string(), Value::Int(204)),
                ("AverageBpm".to_string(), Value::Null),
            ],
        }];
        let xml = generate_xml(&tracks);
        assert!(xml.contains("Name=\"&quot;great&quot; &lt;track&gt;\""));
        assert!(xml.contains("Rating=\"204\""));
        assert!(!xml.contains("Comments="));
        assert!(!xml.contains("AverageBpm="));
        assert!(xml.contains("Location=\"file://localhost/Music/Drum%20%26%20Bass/x.mp3\""));
    }

    #[test]
    fn write_xml_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/deep/test.xml");
        write_xml(&[], &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("<COLLECTION Entries=\"0\">"));
    }

    #[test]
    fn written_document_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.xml");
        let tracks = vec![OutTrack {
            path: "/Music/Café.mp3".to_string(),
            attrs: vec![("Name".to_string(), Value::Text("Café".into()))],
        }];
        write_xml(&tracks, &path).unwrap();

        let xml = parse(&path).unwrap();
        assert_eq!(xml.tracks.len(), 1);
        assert_eq!(xml.tracks[0].get("Location"), Some("Music/Café.mp3"));
        assert_eq!(xml.tracks[0].get("Name"), Some("Café"));
    }
}
