use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use cv_calib::{collect_mono, collect_stereo, init_thread_pool, AcquisitionReport};
use cv_calib3d::{
    calibrate_mono_with_options, calibrate_stereo_from_models, calibrate_stereo_with_options,
    compare_calibrations, rectify_pair, rectify_with_options, render_chessboard, undistort_image,
    validate_mono, validate_stereo, CalibrationPattern, CalibrationRecord, ChessboardDetector,
    ChessboardParams, MonoCalibrationOptions, MonoRecord, ObservationStore, QualityBand,
    RectifyOptions, StereoCalibrationOptions, StereoObservationStore, StereoRecord,
};
use cv_core::CameraModel;
use cv_videoio::{FrameWriter, ImageSequence, ImageSource, PngSequenceWriter, VideoError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

type CliError = Box<dyn Error>;
type CliResult<T> = Result<T, CliError>;

/// Chessboard camera calibration.
#[derive(Debug, Parser)]
#[command(author, version, about = "Mono and stereo chessboard calibration")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Worker threads for detection; defaults to CV_CALIB_THREADS or all cores.
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Optional JSON CalibConfig. Defaults are used if omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Calibrate one camera from a directory of chessboard images.
    Mono(MonoArgs),
    /// Calibrate a synchronized camera pair and rectify it.
    Stereo(StereoArgs),
    /// Render a printable chessboard.
    Pattern(PatternImageArgs),
    /// Print a saved calibration record.
    Show {
        record: PathBuf,
    },
    /// Compare a mono record with a stereo record.
    Compare(CompareArgs),
    /// Rectify image pairs with a saved stereo record.
    Rectify(RectifyArgs),
}

#[derive(Debug, Clone, Args)]
struct PatternArgs {
    /// Interior corners per row.
    #[arg(long, default_value_t = 9)]
    cols: usize,
    /// Interior corners per column.
    #[arg(long, default_value_t = 6)]
    rows: usize,
    /// Square edge length in world units (millimetres by convention).
    #[arg(long, default_value_t = 25.0)]
    square: f64,
}

impl PatternArgs {
    fn build(&self) -> CliResult<CalibrationPattern> {
        Ok(CalibrationPattern::new(self.cols, self.rows, self.square)?)
    }
}

#[derive(Debug, Args)]
struct MonoArgs {
    /// Directory of calibration images, processed in file-name order.
    #[arg(long)]
    images: PathBuf,
    #[command(flatten)]
    pattern: PatternArgs,
    /// Output JSON record.
    #[arg(long, default_value = "mono_calibration.json")]
    output: PathBuf,
    /// Also write undistorted copies of every input image here.
    #[arg(long)]
    undistorted_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IntrinsicsMode {
    /// Keep both cameras' intrinsics and solve only the relative pose.
    Fixed,
    /// Refine intrinsics, distortion and the relative pose together.
    Joint,
}

#[derive(Debug, Args)]
struct StereoArgs {
    #[arg(long)]
    left: PathBuf,
    #[arg(long)]
    right: PathBuf,
    #[command(flatten)]
    pattern: PatternArgs,
    #[arg(long, value_enum)]
    intrinsics: IntrinsicsMode,
    /// Mono record seeding the left camera instead of a fresh mono solve.
    #[arg(long, requires = "right_intrinsics")]
    left_intrinsics: Option<PathBuf>,
    #[arg(long, requires = "left_intrinsics")]
    right_intrinsics: Option<PathBuf>,
    #[arg(long, default_value = "stereo_calibration.json")]
    output: PathBuf,
    /// Save the record without rectification matrices.
    #[arg(long)]
    no_rectify: bool,
}

#[derive(Debug, Args)]
struct PatternImageArgs {
    #[arg(long, default_value_t = 9)]
    cols: usize,
    #[arg(long, default_value_t = 6)]
    rows: usize,
    #[arg(long, default_value_t = 80)]
    square_px: u32,
    #[arg(long, default_value_t = 80)]
    border_px: u32,
    #[arg(long, default_value = "chessboard.png")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct CompareArgs {
    #[arg(long)]
    mono: PathBuf,
    #[arg(long)]
    stereo: Option<PathBuf>,
    /// Square size of the records is in millimetres.
    #[arg(long)]
    unit_mm: bool,
    /// Print the comparison as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RectifyArgs {
    /// Stereo record produced by `stereo`.
    #[arg(long)]
    calibration: PathBuf,
    #[arg(long)]
    left: PathBuf,
    #[arg(long)]
    right: PathBuf,
    #[arg(long)]
    output_dir: PathBuf,
}

/// Options file accepted by `--config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct CalibConfig {
    detector: ChessboardParams,
    mono: MonoCalibrationOptions,
    stereo: StereoCalibrationOptions,
    rectify: RectifyOptions,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> CliResult<T> {
    let data = fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

fn load_config(path: Option<&Path>) -> CliResult<CalibConfig> {
    match path {
        Some(path) => load_json_file(path),
        None => Ok(CalibConfig::default()),
    }
}

fn load_mono(path: &Path) -> CliResult<MonoRecord> {
    match CalibrationRecord::load(path)? {
        CalibrationRecord::Mono(record) => Ok(record),
        CalibrationRecord::Stereo(_) => {
            Err(format!("{} holds a stereo record, expected mono", path.display()).into())
        }
    }
}

fn load_stereo(path: &Path) -> CliResult<StereoRecord> {
    match CalibrationRecord::load(path)? {
        CalibrationRecord::Stereo(record) => Ok(record),
        CalibrationRecord::Mono(_) => {
            Err(format!("{} holds a mono record, expected stereo", path.display()).into())
        }
    }
}

fn print_acquisition(label: &str, report: &AcquisitionReport) {
    println!(
        "{label}: {} frames, {} used, {} without pattern, {} unreadable",
        report.total,
        report.used.len(),
        report.rejected.len(),
        report.unreadable.len()
    );
}

fn format_matrix(rows: &[[f64; 3]; 3]) -> String {
    rows.iter()
        .map(|r| format!("  [{:12.4} {:12.4} {:12.4}]", r[0], r[1], r[2]))
        .collect::<Vec<_>>()
        .join("\n")
}

fn run_mono(args: &MonoArgs, config: &CalibConfig) -> CliResult<MonoRecord> {
    let pattern = args.pattern.build()?;
    let mut store =
        ObservationStore::new(pattern).with_detector(ChessboardDetector::new(config.detector));
    let mut source = ImageSequence::open(&args.images)?;
    let report = collect_mono(&mut source, &mut store)?;
    print_acquisition("images", &report);

    let image_size = store
        .image_size()
        .ok_or("no image showed the complete pattern")?;
    let calib = calibrate_mono_with_options(&store, image_size, &config.mono)?;
    let validation = validate_mono(&calib, &store)?;
    let outliers = validation.outliers(2.0 * validation.rms_error.max(0.5));
    if !outliers.is_empty() {
        warn!(?outliers, "views with large reprojection error");
    }

    let record = MonoRecord::from_calibration(&calib);
    CalibrationRecord::from(record.clone()).save(&args.output)?;
    println!(
        "mono rms {:.4} px ({}), max {:.4} px, saved to {}",
        validation.rms_error,
        validation.quality,
        validation.max_error,
        args.output.display()
    );

    if let Some(dir) = &args.undistorted_dir {
        write_undistorted(&args.images, dir, &calib.model)?;
    }
    Ok(record)
}

fn write_undistorted(images: &Path, output: &Path, model: &CameraModel) -> CliResult<()> {
    let mut source = ImageSequence::open(images)?;
    let mut writer = PngSequenceWriter::new(output, "undistorted")?;
    loop {
        match source.next_frame() {
            Ok(Some(frame)) => match undistort_image(&frame, model, None) {
                Ok(out) => writer.write(&out)?,
                Err(e) => warn!(error = %e, "skipping image"),
            },
            Ok(None) => break,
            Err(VideoError::Unreadable { index, reason }) => {
                warn!(frame = index, %reason, "skipping unreadable frame")
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(frames = writer.frame_count(), dir = %output.display(), "wrote undistorted images");
    Ok(())
}

fn run_stereo(args: &StereoArgs, config: &CalibConfig) -> CliResult<StereoRecord> {
    let pattern = args.pattern.build()?;
    let mut stores =
        StereoObservationStore::new(pattern).with_detector(ChessboardDetector::new(config.detector));
    let mut left = ImageSequence::open(&args.left)?;
    let mut right = ImageSequence::open(&args.right)?;
    if left.len() != right.len() {
        warn!(left = left.len(), right = right.len(), "image counts differ");
    }
    let report = collect_stereo(&mut left, &mut right, &mut stores)?;
    print_acquisition("pairs", &report);

    let (left_store, right_store) = stores.into_parts();
    let image_size = left_store
        .image_size()
        .ok_or("no pair showed the complete pattern in both views")?;
    let fix_intrinsics = args.intrinsics == IntrinsicsMode::Fixed;

    let calib = match (&args.left_intrinsics, &args.right_intrinsics) {
        (Some(l), Some(r)) => {
            let (l, r) = (load_mono(l)?.camera_model(), load_mono(r)?.camera_model());
            calibrate_stereo_from_models(
                &left_store,
                &right_store,
                &l,
                &r,
                fix_intrinsics,
                &config.stereo,
            )?
        }
        _ => {
            let l = calibrate_mono_with_options(&left_store, image_size, &config.mono)?;
            let r = calibrate_mono_with_options(&right_store, image_size, &config.mono)?;
            println!(
                "mono rms: left {:.4} px, right {:.4} px",
                l.rms_reprojection_error, r.rms_reprojection_error
            );
            calibrate_stereo_with_options(
                &left_store,
                &right_store,
                &l,
                &r,
                fix_intrinsics,
                &config.stereo,
            )?
        }
    };

    let validation = validate_stereo(&calib, &left_store, &right_store)?;
    let rectification = if args.no_rectify {
        None
    } else {
        Some(rectify_with_options(
            &calib.left,
            &calib.right,
            &calib.pose,
            &config.rectify,
        )?)
    };

    let record = StereoRecord::from_calibration(&calib, rectification.as_ref());
    CalibrationRecord::from(record.clone()).save(&args.output)?;
    let angles = calib.pose.rotation_angles_deg();
    println!(
        "stereo rms {:.4} px ({}), baseline {:.2}, rotation [{:.3} {:.3} {:.3}] deg, saved to {}",
        validation.combined_rms,
        validation.quality,
        calib.pose.baseline,
        angles.x,
        angles.y,
        angles.z,
        args.output.display()
    );
    Ok(record)
}

fn run_pattern(args: &PatternImageArgs) -> CliResult<()> {
    let pattern = CalibrationPattern::new(args.cols, args.rows, 1.0)?;
    let board = render_chessboard(&pattern, args.square_px, args.border_px)?;
    board.save(&args.output)?;
    println!(
        "{}x{} board ({}x{} px) written to {}",
        args.cols,
        args.rows,
        board.width(),
        board.height(),
        args.output.display()
    );
    Ok(())
}

fn describe_record(record: &CalibrationRecord) -> String {
    let mut out = Vec::new();
    let rms = record.reprojection_error();
    match record {
        CalibrationRecord::Mono(m) => {
            out.push(format!("mono calibration (schema {})", m.schema_version));
            out.push(format!(
                "image {}x{}, pattern {}x{} @ {}, {} observations",
                m.image_size[0],
                m.image_size[1],
                m.pattern_size[0],
                m.pattern_size[1],
                m.square_size,
                m.observation_count
            ));
            out.push(format!("rms {rms:.4} px ({})", QualityBand::from_rms(rms)));
            out.push(format!("camera matrix:\n{}", format_matrix(&m.camera_matrix)));
            out.push(format!("distortion: {:?}", m.distortion_coefficients));
        }
        CalibrationRecord::Stereo(s) => {
            out.push(format!("stereo calibration (schema {})", s.schema_version));
            out.push(format!(
                "image {}x{}, pattern {}x{} @ {}, {} pairs",
                s.image_size[0],
                s.image_size[1],
                s.pattern_size[0],
                s.pattern_size[1],
                s.square_size,
                s.observation_count
            ));
            out.push(format!("rms {rms:.4} px ({})", QualityBand::from_rms(rms)));
            out.push(format!("left camera matrix:\n{}", format_matrix(&s.camera_matrix_left)));
            out.push(format!("right camera matrix:\n{}", format_matrix(&s.camera_matrix_right)));
            let angles = s.pose().rotation_angles_deg();
            out.push(format!(
                "rotation [{:.3} {:.3} {:.3}] deg",
                angles.x, angles.y, angles.z
            ));
            out.push(format!("translation {:?}", s.translation_vector));
            out.push(format!("baseline {:.3}", s.baseline));
            out.push(format!("rectified: {}", if s.is_rectified() { "yes" } else { "no" }));
        }
    }
    out.join("\n")
}

fn run_compare(args: &CompareArgs) -> CliResult<String> {
    let mono = load_mono(&args.mono)?;
    let stereo = args.stereo.as_deref().map(load_stereo).transpose()?;
    let comparison = compare_calibrations(&mono, stereo.as_ref(), args.unit_mm);
    if args.json {
        return Ok(serde_json::to_string_pretty(&comparison)?);
    }

    let mut out = vec![format!(
        "mono:   rms {:.4} px, {} observations, focal {:.2}",
        comparison.mono_error, comparison.mono_observations, comparison.mono_focal
    )];
    if let (Some(err), Some(n), Some(baseline)) = (
        comparison.stereo_error,
        comparison.stereo_observations,
        comparison.baseline,
    ) {
        out.push(format!(
            "stereo: rms {err:.4} px, {n} pairs, baseline {baseline:.2}"
        ));
    }
    if let Some(better) = comparison.better {
        out.push(format!("lower error: {better:?}"));
    }
    out.extend(comparison.warnings.iter().map(|w| format!("warning: {w}")));
    Ok(out.join("\n"))
}

fn run_rectify(args: &RectifyArgs, config: &CalibConfig) -> CliResult<usize> {
    let record = load_stereo(&args.calibration)?;
    let set = rectify_with_options(
        &record.left_model(),
        &record.right_model(),
        &record.pose(),
        &config.rectify,
    )?;

    let mut left = ImageSequence::open(&args.left)?;
    let mut right = ImageSequence::open(&args.right)?;
    let mut left_out = PngSequenceWriter::new(&args.output_dir, "left")?;
    let mut right_out = PngSequenceWriter::new(&args.output_dir, "right")?;
    loop {
        let pair = match (left.next_frame(), right.next_frame()) {
            (Ok(Some(l)), Ok(Some(r))) => (l, r),
            (Ok(None), _) | (_, Ok(None)) => break,
            (Err(VideoError::Unreadable { index, reason }), _)
            | (_, Err(VideoError::Unreadable { index, reason })) => {
                warn!(pair = index, %reason, "skipping unreadable pair");
                continue;
            }
            (Err(e), _) | (_, Err(e)) => return Err(e.into()),
        };
        match rectify_pair(&pair.0, &pair.1, &set) {
            Ok((l, r)) => {
                left_out.write(&l)?;
                right_out.write(&r)?;
            }
            Err(e) => warn!(error = %e, "skipping pair"),
        }
    }
    println!(
        "{} rectified pairs written to {}",
        left_out.frame_count(),
        args.output_dir.display()
    );
    Ok(left_out.frame_count())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    init_thread_pool(cli.threads)?;
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Command::Mono(args) => {
            run_mono(args, &config)?;
        }
        Command::Stereo(args) => {
            run_stereo(args, &config)?;
        }
        Command::Pattern(args) => run_pattern(args)?,
        Command::Show { record } => println!("{}", describe_record(&CalibrationRecord::load(record)?)),
        Command::Compare(args) => println!("{}", run_compare(args)?),
        Command::Rectify(args) => {
            run_rectify(args, &config)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_calib3d::{detect_corners, render_board_view};
    use cv_core::{rodrigues_to_rotation_matrix, CameraIntrinsics, Distortion, Pose};
    use nalgebra::Vector3;
    use tempfile::tempdir;

    fn render_views(dir: &Path, model: &CameraModel, rel: Option<&Pose>) {
        let pattern = CalibrationPattern::new(9, 6, 25.0).unwrap();
        let centre = Vector3::new(100.0, 62.5, 0.0);
        let mut writer = PngSequenceWriter::new(dir, "view").unwrap();
        for (i, rvec) in [
            Vector3::new(0.25, 0.0, 0.0),
            Vector3::new(0.0, 0.3, 0.0),
            Vector3::new(-0.25, 0.15, 0.05),
            Vector3::new(0.1, -0.3, -0.1),
            Vector3::new(0.3, 0.25, 0.0),
        ]
        .iter()
        .enumerate()
        {
            let r = rodrigues_to_rotation_matrix(rvec);
            let pose = Pose::new(r, Vector3::new(0.0, 0.0, 600.0 + 20.0 * i as f64) - r * centre);
            let pose = rel.map_or(pose, |rel| rel.compose(&pose));
            writer
                .write(&render_board_view(&pattern, model, &pose, 128))
                .unwrap();
        }
    }

    fn camera() -> CameraModel {
        CameraModel::new(
            CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0, 640, 480),
            Distortion::none(),
        )
    }

    #[test]
    fn stereo_requires_intrinsics_mode() {
        let missing = Cli::try_parse_from(["cv-calib", "stereo", "--left", "l", "--right", "r"]);
        assert!(missing.is_err());
        let cli = Cli::try_parse_from([
            "cv-calib", "-v", "stereo", "--left", "l", "--right", "r", "--intrinsics", "joint",
            "--cols", "7",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Stereo(args) => {
                assert_eq!(args.intrinsics, IntrinsicsMode::Joint);
                assert_eq!(args.pattern.cols, 7);
                assert_eq!(args.pattern.rows, 6);
            }
            other => panic!("unexpected command {other:?}"),
        }
        let lonely = Cli::try_parse_from([
            "cv-calib", "stereo", "--left", "l", "--right", "r", "--intrinsics", "fixed",
            "--left-intrinsics", "m.json",
        ]);
        assert!(lonely.is_err());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"{ "mono": { "fix_principal_point": true }, "rectify": { "alpha": 0.5 } }"#,
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert!(config.mono.fix_principal_point);
        assert!(!config.mono.zero_tangent_dist);
        assert_eq!(config.rectify.alpha, Some(0.5));
        assert_eq!(config.detector, ChessboardParams::default());
        assert_eq!(load_config(None).unwrap(), CalibConfig::default());
    }

    #[test]
    fn pattern_command_writes_detectable_board() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("board.png");
        run_pattern(&PatternImageArgs {
            cols: 7,
            rows: 5,
            square_px: 30,
            border_px: 30,
            output: output.clone(),
        })
        .unwrap();
        let board = image::open(&output).unwrap().into_luma8();
        let pattern = CalibrationPattern::new(7, 5, 1.0).unwrap();
        assert!(detect_corners(&board, &pattern).found);
    }

    #[test]
    fn mono_then_show_and_compare() {
        let dir = tempdir().unwrap();
        let images = dir.path().join("images");
        render_views(&images, &camera(), None);
        let output = dir.path().join("mono.json");
        let record = run_mono(
            &MonoArgs {
                images,
                pattern: PatternArgs { cols: 9, rows: 6, square: 25.0 },
                output: output.clone(),
                undistorted_dir: Some(dir.path().join("undistorted")),
            },
            &CalibConfig::default(),
        )
        .unwrap();
        assert_eq!(record.observation_count, 5);
        assert!((record.camera_matrix[0][0] - 800.0).abs() < 8.0);
        assert_eq!(ImageSequence::open(dir.path().join("undistorted")).unwrap().len(), 5);

        let shown = describe_record(&CalibrationRecord::load(&output).unwrap());
        assert!(shown.starts_with("mono calibration (schema 1)"));

        let summary = run_compare(&CompareArgs {
            mono: output.clone(),
            stereo: None,
            unit_mm: true,
            json: false,
        })
        .unwrap();
        assert!(summary.starts_with("mono:"));
        assert!(run_compare(&CompareArgs {
            mono: output.clone(),
            stereo: Some(output),
            unit_mm: true,
            json: true,
        })
        .is_err());
    }

    #[test]
    fn stereo_then_rectify() {
        let dir = tempdir().unwrap();
        let (left, right) = (dir.path().join("left"), dir.path().join("right"));
        let rel = Pose::from_rotation_vector(&Vector3::new(0.0, 0.02, 0.0), Vector3::new(-60.0, 0.0, 0.0));
        render_views(&left, &camera(), None);
        render_views(&right, &camera(), Some(&rel));

        let output = dir.path().join("stereo.json");
        let record = run_stereo(
            &StereoArgs {
                left: left.clone(),
                right: right.clone(),
                pattern: PatternArgs { cols: 9, rows: 6, square: 25.0 },
                intrinsics: IntrinsicsMode::Fixed,
                left_intrinsics: None,
                right_intrinsics: None,
                output: output.clone(),
                no_rectify: false,
            },
            &CalibConfig::default(),
        )
        .unwrap();
        assert!(record.is_rectified());
        assert!((record.baseline - 60.0).abs() < 1.5);
        assert!(describe_record(&CalibrationRecord::load(&output).unwrap()).contains("rectified: yes"));

        let rectified = run_rectify(
            &RectifyArgs {
                calibration: output,
                left,
                right,
                output_dir: dir.path().join("rectified"),
            },
            &CalibConfig::default(),
        )
        .unwrap();
        assert_eq!(rectified, 5);
    }
}
