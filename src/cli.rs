use std::path::{Path, PathBuf};

use clap::Parser;

use crate::catalog::{self, Catalog};
use crate::error::SyncError;
use crate::library::{self, Reconciled};
use crate::mapping::{self, FieldMap};
use crate::rekordbox::{self, OutTrack};
use crate::table::{Table, Value};

#[derive(Parser)]
#[command(name = "rekordbeets", version)]
enum Cli {
    /// Generate a Rekordbox import XML from the beets library
    Export(ExportArgs),
    /// Report how the two libraries overlap and differ
    Report(ReportArgs),
    /// Copy Rekordbox-side values back into beets fields
    Sync(SyncArgs),
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Beets library database (default: $BEETS_LIBRARY, then the beets config dir)
    #[arg(long)]
    library: Option<PathBuf>,
    /// Field mapping table, YAML (default: built-in table)
    #[arg(long)]
    fields: Option<PathBuf>,
    /// Case-insensitive substring filter on title/artist/album
    #[arg(long)]
    query: Option<String>,
    /// Only consider Rekordbox tracks under this directory (default: $BEETS_MUSIC_DIR)
    #[arg(long)]
    music_dir: Option<String>,
}

#[derive(clap::Args)]
struct ExportArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Existing Rekordbox XML export, used to detect already-imported tracks
    #[arg(long)]
    xml: Option<PathBuf>,
    /// Output path for the generated document
    #[arg(long, default_value = "rekordbeets.xml")]
    out: PathBuf,
    /// Export only tracks absent from the Rekordbox library
    #[arg(long, requires = "xml")]
    missing: bool,
}

#[derive(clap::Args)]
struct ReportArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Rekordbox XML export (default: $REKORDBOX_XML)
    #[arg(long)]
    xml: Option<PathBuf>,
    /// Write the computed tables as JSON into this directory
    #[arg(long)]
    dump: Option<PathBuf>,
    /// List per-field differences for tracks that need a sync
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::Args)]
struct SyncArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Rekordbox XML export (default: $REKORDBOX_XML)
    #[arg(long)]
    xml: Option<PathBuf>,
    /// Show what would change without writing to the library
    #[arg(long)]
    dry_run: bool,
    /// Stop at the first track that fails to update instead of continuing
    #[arg(long)]
    abort_on_error: bool,
}

pub fn run() -> Result<(), SyncError> {
    match Cli::parse() {
        Cli::Export(args) => export(args),
        Cli::Report(args) => report(args),
        Cli::Sync(args) => sync(args),
    }
}

fn open_catalog(common: &CommonArgs) -> Result<Catalog, SyncError> {
    let path = catalog::resolve_library_path(common.library.as_deref()).ok_or_else(|| {
        SyncError::Config(
            "cannot locate the beets library; pass --library or set BEETS_LIBRARY".to_string(),
        )
    })?;
    Catalog::open(&path)
}

fn resolve_xml(flag: Option<PathBuf>) -> Result<PathBuf, SyncError> {
    flag.or_else(|| std::env::var("REKORDBOX_XML").ok().map(PathBuf::from))
        .ok_or_else(|| {
            SyncError::Config(
                "no rekordbox XML given; pass --xml or set REKORDBOX_XML".to_string(),
            )
        })
}

fn music_dir(common: &CommonArgs) -> Option<String> {
    common
        .music_dir
        .clone()
        .or_else(|| std::env::var("BEETS_MUSIC_DIR").ok())
}

fn load_beets(common: &CommonArgs, catalog: &Catalog, map: &FieldMap) -> Result<Table, SyncError> {
    let items = catalog.items(common.query.as_deref())?;
    library::load_beets_table(&items, map)
}

fn load_rekordbox(path: &Path, map: &FieldMap) -> Result<Table, SyncError> {
    let xml = rekordbox::parse(path)?;
    library::load_rekordbox_table(&xml, map)
}

/// Turn an export projection into writer input. Location becomes the track
/// path; every other column rides along as an attribute.
fn out_tracks(export: &Table) -> Result<Vec<OutTrack>, SyncError> {
    let locations = export.column("Location").ok_or_else(|| {
        SyncError::Mapping("export table has no 'Location' column".to_string())
    })?;
    let attr_names: Vec<String> = export
        .column_names()
        .filter(|name| *name != "Location")
        .map(str::to_string)
        .collect();

    let mut tracks = Vec::with_capacity(export.len());
    for row in 0..export.len() {
        let path = match &locations[row] {
            Value::Text(path) if !path.is_empty() => path.clone(),
            other => {
                return Err(SyncError::Mapping(format!(
                    "exported row {} has no usable location: {other:?}",
                    row + 1
                )));
            }
        };
        let attrs = attr_names
            .iter()
            .map(|name| {
                let value = export.value(row, name).cloned().unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect();
        tracks.push(OutTrack { path, attrs });
    }
    Ok(tracks)
}

fn export(args: ExportArgs) -> Result<(), SyncError> {
    if args.out.is_dir() {
        return Err(SyncError::Config(format!(
            "output path is a directory: {}",
            args.out.display()
        )));
    }

    let map = FieldMap::load(args.common.fields.as_deref())?;
    let catalog = open_catalog(&args.common)?;
    let beets = load_beets(&args.common, &catalog, &map)?;
    eprintln!("Loaded {} beets tracks", beets.len());

    let row_filter = if args.missing {
        let xml_path = resolve_xml(args.xml)?;
        let rb = load_rekordbox(&xml_path, &map)?;
        let result = library::crop(&beets, &rb, music_dir(&args.common).as_deref())?;
        eprintln!(
            "{} tracks not yet in the rekordbox library",
            result.only_beets.len()
        );
        Some(result.only_beets.keys().to_vec())
    } else {
        None
    };

    let export = library::export_table(&beets, &map, row_filter.as_deref())?;
    if export.is_empty() {
        eprintln!("No tracks to export. Nothing to do.");
        return Ok(());
    }

    let tracks = out_tracks(&export)?;
    rekordbox::write_xml(&tracks, &args.out)?;
    eprintln!("Wrote {} tracks to {}", tracks.len(), args.out.display());
    Ok(())
}

fn print_only_in(label: &str, table: &Table, path_column: &str) {
    if table.is_empty() {
        return;
    }
    println!("\n{label}:");
    if let Some(paths) = table.column(path_column) {
        for path in paths {
            println!("  {}", path.render());
        }
    }
}

fn report(args: ReportArgs) -> Result<(), SyncError> {
    let map = FieldMap::load(args.common.fields.as_deref())?;
    let catalog = open_catalog(&args.common)?;
    let beets = load_beets(&args.common, &catalog, &map)?;
    let xml_path = resolve_xml(args.xml)?;
    let rb = load_rekordbox(&xml_path, &map)?;

    let result = library::crop(&beets, &rb, music_dir(&args.common).as_deref())?;
    let Reconciled {
        common,
        only_beets,
        only_rekordbox,
        rekordbox_in_scope,
    } = &result;

    println!("beets tracks:      {}", beets.len());
    println!("rekordbox tracks:  {}", rb.len());
    if *rekordbox_in_scope != rb.len() {
        println!("  under music dir: {rekordbox_in_scope}");
    }
    println!("in both libraries: {}", common.len());
    println!("only in beets:     {}", only_beets.len());
    println!("only in rekordbox: {}", only_rekordbox.len());

    print_only_in("Only in beets", only_beets, "path");
    print_only_in("Only in rekordbox", only_rekordbox, "Location");

    let updates = library::sync_changes(common, &map)?;
    println!("\ntracks with sync differences: {}", updates.len());
    if args.verbose {
        for update in &updates {
            println!("  {}", update.path);
            for change in update.changed_fields() {
                println!(
                    "    {}: {} -> {}",
                    change.field,
                    change.current.render(),
                    change.incoming.render()
                );
            }
        }
    }

    if let Some(dir) = &args.dump {
        library::dump_tables(
            dir,
            &[
                ("beets", &beets),
                ("rekordbox", &rb),
                ("common", common),
                ("only_beets", only_beets),
                ("only_rekordbox", only_rekordbox),
            ],
        )?;
        let fields_yaml = mapping::source_text(args.common.fields.as_deref())?;
        std::fs::write(dir.join("fields.yaml"), fields_yaml).map_err(|err| {
            SyncError::Load(format!("cannot write {}: {err}", dir.join("fields.yaml").display()))
        })?;
        eprintln!("\nDumped tables to {}", dir.display());
    }
    Ok(())
}

fn sync(args: SyncArgs) -> Result<(), SyncError> {
    let map = FieldMap::load(args.common.fields.as_deref())?;
    let catalog = open_catalog(&args.common)?;
    let beets = load_beets(&args.common, &catalog, &map)?;
    let xml_path = resolve_xml(args.xml)?;
    let rb = load_rekordbox(&xml_path, &map)?;

    let result = library::crop(&beets, &rb, music_dir(&args.common).as_deref())?;
    eprintln!("{} tracks in both libraries", result.common.len());

    let updates = library::sync_changes(&result.common, &map)?;
    if updates.is_empty() {
        eprintln!("All synced fields already match. Nothing to update.");
        return Ok(());
    }

    let total = updates.len();
    if args.dry_run {
        eprintln!("{total} tracks would be updated (dry run)\n");
        for update in &updates {
            println!("{}", update.path);
            for change in update.changed_fields() {
                println!(
                    "  {}: {} -> {}",
                    change.field,
                    change.current.render(),
                    change.incoming.render()
                );
            }
        }
        return Ok(());
    }

    let mut idx = 0usize;
    let (applied, failures) = library::apply_updates(&updates, args.abort_on_error, |update| {
        idx += 1;
        eprintln!("[{idx}/{total}] {}", update.path);
        catalog.update_item(update.id, &update.to_field_values())
    })?;

    for failure in &failures {
        eprintln!("FAIL {failure}");
    }
    eprintln!("\nDone: {applied} updated, {} failed", failures.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn export_fixture() -> Table {
        let keys = vec!["/music/a.mp3".to_string(), "/music/b.mp3".to_string()];
        let mut columns = BTreeMap::new();
        columns.insert(
            "Location".to_string(),
            vec![
                Value::Text("/music/a.mp3".into()),
                Value::Text("/music/b.mp3".into()),
            ],
        );
        columns.insert(
            "Name".to_string(),
            vec![Value::Text("A".into()), Value::Text("B".into())],
        );
        columns.insert("Rating".to_string(), vec![Value::Int(204), Value::Int(0)]);
        Table::new(keys, columns).unwrap()
    }

    #[test]
    fn out_tracks_split_location_from_attributes() {
        let tracks = out_tracks(&export_fixture()).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].path, "/music/a.mp3");
        assert!(tracks[0].attrs.iter().all(|(name, _)| name != "Location"));
        assert!(tracks[0]
            .attrs
            .contains(&("Rating".to_string(), Value::Int(204))));
    }

    #[test]
    fn out_tracks_require_a_location_column() {
        let table = export_fixture().drop_columns(&["Location".to_string()]);
        assert!(matches!(out_tracks(&table), Err(SyncError::Mapping(_))));
    }

    #[test]
    fn out_tracks_reject_rows_without_a_location() {
        let mut table = export_fixture();
        table.map_column("Location", |_| Value::Null);
        assert!(matches!(out_tracks(&table), Err(SyncError::Mapping(_))));
    }

    #[test]
    fn missing_flag_requires_an_xml_path() {
        let err = Cli::try_parse_from(["rekordbeets", "export", "--missing"]);
        assert!(err.is_err());
        assert!(Cli::try_parse_from([
            "rekordbeets", "export", "--missing", "--xml", "lib.xml"
        ])
        .is_ok());
    }

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::try_parse_from([
            "rekordbeets",
            "sync",
            "--xml",
            "lib.xml",
            "--dry-run",
            "--abort-on-error",
            "--query",
            "burial",
        ])
        .unwrap();
        match cli {
            Cli::Sync(args) => {
                assert!(args.dry_run);
                assert!(args.abort_on_error);
                assert_eq!(args.common.query.as_deref(), Some("burial"));
            }
            _ => panic!("expected the sync subcommand"),
        }
    }

    #[test]
    fn resolve_xml_prefers_the_flag() {
        let path = PathBuf::from("/tmp/lib.xml");
        assert_eq!(resolve_xml(Some(path.clone())).unwrap(), path);
    }
}
