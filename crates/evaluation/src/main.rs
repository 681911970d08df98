mod scene;
mod volume;

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dynfuse::{Extent, Fusion, FusionParams, Intrinsics, PoseLog, RangeFilter};
use log::info;
use nalgebra::Point3;
use ndarray::Array3;

use scene::{Scene, SceneDetector};
use volume::GridFactory;

/// Runs the fusion engine over a synthetic rigid scene and reports the
/// recovered camera and object trajectories.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of frames to process
    #[arg(short, long, default_value_t = 60)]
    frames: usize,

    /// Output CSV path for the recovered trajectories
    #[arg(short, long, default_value = "poses.csv")]
    output: PathBuf,

    /// Box displacement per frame along x, in meters
    #[arg(short, long, default_value_t = 0.004)]
    box_speed: f32,

    /// Background voxel edge length in meters
    #[arg(long, default_value_t = 0.03125)]
    background_voxel: f32,

    /// Write per-frame depth images to a debug directory
    #[arg(short, long, default_value_t = false)]
    write_images: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let intrinsics = Intrinsics::new(250.0, 250.0, 159.5, 119.5, 320, 240);
    let scene = Scene {
        box_velocity: nalgebra::Vector3::new(args.box_speed, 0.0, 0.0),
        ..Scene::default()
    };
    let params = FusionParams::default();

    let factory = GridFactory {
        background_extent: Extent::new(
            Point3::new(-2.0, -2.0, -0.5),
            Point3::new(2.0, 2.0, 3.5),
        ),
        background_voxel: args.background_voxel,
        intrinsics,
    };

    let mut fusion = Fusion::new(
        params.clone(),
        intrinsics,
        Box::new(SceneDetector::new(scene.clone(), intrinsics)),
        Box::new(RangeFilter::new(params.depth_min, params.depth_max)),
        Box::new(factory),
    )?;

    if args.write_images {
        fs::create_dir_all("debug")?;
    }

    let rgb = Array3::<u8>::zeros((intrinsics.height, intrinsics.width, 3));
    let mut log = PoseLog::new();
    for frame in 0..args.frames {
        let (depth, _) = scene.render(&intrinsics, frame);
        fusion.process_frame(&depth, &rgb, &mut log)?;

        if args.write_images {
            write_depth_image(&depth, params.depth_max, frame)?;
        }
        if frame % 10 == 0 {
            info!(
                "frame {}: {} active objects, camera at {:?}",
                frame,
                fusion.objects().count(),
                fusion.camera_pose().translation.vector
            );
        }
    }

    let mut out = BufWriter::new(
        File::create(&args.output)
            .with_context(|| format!("creating {}", args.output.display()))?,
    );
    log.write_csv(&mut out)?;
    info!("wrote trajectories to {}", args.output.display());

    report_errors(&log, &scene, args.frames);
    Ok(())
}

/// Logs trajectory error against the analytic ground truth.
fn report_errors(log: &PoseLog, scene: &Scene, frames: usize) {
    let camera_drift = log
        .camera()
        .last()
        .map(|(_, pose)| pose.translation.vector.norm())
        .unwrap_or(0.0);
    info!("camera drift over {} frames: {:.4} m", frames, camera_drift);

    for id in log.object_ids().collect::<Vec<_>>() {
        let Some(trajectory) = log.object(id) else {
            continue;
        };
        let (Some(first), Some(last)) = (trajectory.first(), trajectory.last()) else {
            continue;
        };
        let recovered = last.1.translation.vector - first.1.translation.vector;
        let truth = scene.box_center(last.0) - scene.box_center(first.0);
        info!(
            "object {}: recovered displacement {:.4} m, truth {:.4} m, error {:.4} m",
            id,
            recovered.norm(),
            truth.norm(),
            (recovered - truth).norm()
        );
    }
}

/// Dumps a depth frame as an 8-bit grayscale image under `debug/`.
fn write_depth_image(depth: &ndarray::Array2<f32>, max_depth: f32, frame: usize) -> Result<()> {
    let (height, width) = depth.dim();
    let mut image = image::GrayImage::new(width as u32, height as u32);
    for ((y, x), &z) in depth.indexed_iter() {
        let value = ((z / max_depth).clamp(0.0, 1.0) * 255.0) as u8;
        image.put_pixel(x as u32, y as u32, image::Luma([value]));
    }
    image
        .save(format!("debug/depth_{frame:04}.png"))
        .context("writing depth image")?;
    Ok(())
}
