use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    AttendanceReport, BoundingBox, EmbeddingId, EnrolledEmbedding, EnrollmentReport, ImageInput, MatchOutcome,
    OutcomeCounts, OwnerId, OwnerScore,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{open_store, remove_from_store, run_blocking, Engine, RemoveTarget};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face identification for attendance")]
struct Cli {
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from one or more photos
    Enroll {
        /// Student identifier
        #[arg(short, long)]
        owner: String,
        /// Replace existing embeddings if at least one photo succeeds
        #[arg(long)]
        replace: bool,
        /// Photos showing exactly one face each
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify everyone in a class photo
    Identify {
        /// Only consider these students (comma-separated)
        #[arg(long, value_delimiter = ',')]
        roster: Vec<String>,
        image: PathBuf,
    },
    /// List enrolled students or one student's embeddings
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Remove enrolled embeddings from the database
    ///
    /// Takes effect from the next command; each run loads its gallery
    /// from the database at start.
    Remove {
        /// Embedding ID to remove
        #[arg(required_unless_present = "owner", conflicts_with = "owner")]
        id: Option<String>,
        /// Remove every embedding of this student instead
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show model and gallery information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let timeout = Duration::from_secs(config.timeout_secs);
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { owner, replace, images } => {
            let engine = Arc::new(Engine::start(&config)?);
            let report = run_blocking(timeout, move || enroll(&engine, &owner, &images, replace)).await??;
            print_enrollment(&report, cli.json)?;
            if report.enrolled() == 0 {
                bail!("no photo could be enrolled");
            }
        }
        Commands::Identify { roster, image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let engine = Arc::new(Engine::start(&config)?);
            let roster: HashSet<OwnerId> = roster.into_iter().map(OwnerId::new).collect();
            let report = run_blocking(timeout, move || {
                if roster.is_empty() {
                    engine.attendance.identify(&bytes)
                } else {
                    engine.attendance.identify_among(&bytes, &roster)
                }
            })
            .await??;
            print_attendance(&report, cli.json)?;
        }
        Commands::List { owner } => {
            let store = open_store(&config)?;
            match owner {
                Some(owner) => {
                    let records = store.for_owner(&OwnerId::new(owner))?;
                    let view: Vec<EmbeddingView> = records.iter().map(EmbeddingView::from).collect();
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&view)?);
                    } else if view.is_empty() {
                        println!("No embeddings enrolled");
                    } else {
                        for e in &view {
                            println!("{}  {}  {}", e.embedding_id, e.enrolled_at, e.source_image);
                        }
                    }
                }
                None => {
                    let owners = store.owners()?;
                    let view: Vec<OwnerView> = owners
                        .iter()
                        .map(|o| OwnerView {
                            owner_id: o.owner_id.to_string(),
                            embeddings: o.embeddings,
                            last_enrolled: o.last_enrolled.to_rfc3339(),
                        })
                        .collect();
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&view)?);
                    } else if view.is_empty() {
                        println!("No students enrolled");
                    } else {
                        for o in &view {
                            println!("{}  {} embedding(s), last {}", o.owner_id, o.embeddings, o.last_enrolled);
                        }
                    }
                }
            }
        }
        Commands::Remove { id, owner } => {
            let store = open_store(&config)?;
            let target = match (id, owner) {
                (_, Some(owner)) => RemoveTarget::Owner(OwnerId::new(owner)),
                (Some(id), None) => RemoveTarget::Embedding(EmbeddingId::new(id)),
                (None, None) => bail!("give an embedding id or --owner"),
            };
            let removed = remove_from_store(&store, &target)?;
            tracing::info!(?target, removed, "embeddings removed");
            if cli.json {
                println!("{}", serde_json::json!({ "removed": removed }));
            } else {
                println!("Removed {removed} embedding(s)");
            }
        }
        Commands::Info => {
            let engine = Engine::start(&config)?;
            let snapshot = engine.gallery.all();
            let view = InfoView {
                model: engine.model_info(),
                database: config.db_path.display().to_string(),
                gallery_version: snapshot.version,
                embeddings: snapshot.len(),
                owners: snapshot.owner_count(),
                match_threshold: config.match_threshold,
                margin: config.margin,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                println!("model:      {} ({}-dim)", view.model.model_version, view.model.embedding_dim);
                println!("detector:   {}", view.model.detector_path.display());
                println!("recognizer: {}", view.model.recognizer_path.display());
                println!("sessions:   {} x {} threads", view.model.pool_size, view.model.intra_threads);
                println!("database:   {}", view.database);
                println!("gallery:    {} embeddings, {} students", view.embeddings, view.owners);
                println!("thresholds: match {} margin {}", view.match_threshold, view.margin);
            }
        }
    }

    Ok(())
}

fn enroll(engine: &Engine, owner: &str, paths: &[PathBuf], replace: bool) -> Result<EnrollmentReport> {
    let owner = OwnerId::new(owner);
    let sources: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    let mut contents = Vec::with_capacity(paths.len());
    for path in paths {
        contents.push(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?);
    }
    let images: Vec<ImageInput<'_>> = sources
        .iter()
        .zip(&contents)
        .map(|(source, bytes)| ImageInput {
            source_ref: source.as_str(),
            bytes: bytes.as_slice(),
        })
        .collect();

    let report = if replace {
        engine.enrollment.reenroll(&owner, &images)?
    } else {
        engine.enrollment.enroll(&owner, &images)?
    };
    Ok(report)
}

#[derive(Serialize)]
struct ImageView {
    source: String,
    embedding_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct EnrollView {
    owner_id: String,
    enrolled: usize,
    failed: usize,
    superseded: usize,
    images: Vec<ImageView>,
}

fn print_enrollment(report: &EnrollmentReport, json: bool) -> Result<()> {
    let view = EnrollView {
        owner_id: report.owner_id.to_string(),
        enrolled: report.enrolled(),
        failed: report.failed(),
        superseded: report.superseded,
        images: report
            .outcomes
            .iter()
            .map(|o| ImageView {
                source: o.source_ref.clone(),
                embedding_id: o.result.as_ref().ok().map(|r| r.embedding_id.to_string()),
                error: o.result.as_ref().err().map(|e| e.to_string()),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    for image in &view.images {
        match (&image.embedding_id, &image.error) {
            (Some(id), _) => println!("ok      {}  -> {id}", image.source),
            (None, Some(e)) => println!("failed  {}  ({e})", image.source),
            (None, None) => {}
        }
    }
    println!(
        "{}: {} enrolled, {} failed, {} replaced",
        view.owner_id, view.enrolled, view.failed, view.superseded
    );
    Ok(())
}

#[derive(Serialize)]
struct FaceView {
    face_index: usize,
    bbox: BoundingBox,
    detection_score: f32,
    outcome: MatchOutcome,
    owner_id: Option<String>,
    similarity: f32,
    candidates: Vec<OwnerScore>,
}

#[derive(Serialize)]
struct AttendanceView {
    gallery_version: u64,
    counts: OutcomeCounts,
    attendees: Vec<String>,
    faces: Vec<FaceView>,
}

fn print_attendance(report: &AttendanceReport, json: bool) -> Result<()> {
    let view = AttendanceView {
        gallery_version: report.gallery_version,
        counts: report.counts,
        attendees: report.attendees().into_iter().map(|o| o.to_string()).collect(),
        faces: report
            .results
            .iter()
            .map(|r| FaceView {
                face_index: r.face_index,
                bbox: r.face.bbox,
                detection_score: r.face.detection_score,
                outcome: r.outcome,
                owner_id: r.owner_id.as_ref().map(|o| o.to_string()),
                similarity: r.similarity,
                candidates: r.candidates.clone(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    for face in &view.faces {
        let verdict = match (face.outcome, &face.owner_id) {
            (MatchOutcome::Matched, Some(owner)) => format!("{owner} ({:.3})", face.similarity),
            (MatchOutcome::Ambiguous { reason }, _) => format!("ambiguous: {reason:?} ({:.3})", face.similarity),
            _ => format!("unknown ({:.3})", face.similarity),
        };
        println!(
            "face {:>2} at ({:.0},{:.0} {:.0}x{:.0}): {verdict}",
            face.face_index, face.bbox.x, face.bbox.y, face.bbox.width, face.bbox.height
        );
    }
    println!(
        "{} face(s): {} matched, {} unmatched, {} ambiguous",
        view.faces.len(),
        view.counts.matched,
        view.counts.unmatched,
        view.counts.ambiguous
    );
    Ok(())
}

#[derive(Serialize)]
struct EmbeddingView {
    embedding_id: String,
    owner_id: String,
    source_image: String,
    enrolled_at: String,
}

impl From<&EnrolledEmbedding> for EmbeddingView {
    fn from(r: &EnrolledEmbedding) -> Self {
        Self {
            embedding_id: r.embedding_id.to_string(),
            owner_id: r.owner_id.to_string(),
            source_image: r.source_image_ref.clone(),
            enrolled_at: r.enrolled_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct OwnerView {
    owner_id: String,
    embeddings: usize,
    last_enrolled: String,
}

#[derive(Serialize)]
struct InfoView {
    model: rollcall_core::runtime::ModelInfo,
    database: String,
    gallery_version: u64,
    embeddings: usize,
    owners: usize,
    match_threshold: f32,
    margin: f32,
}
