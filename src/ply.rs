//! ASCII PLY 形式の点群出力

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;

use crate::error::Result;
use crate::triangulation::Point3D;

/// 色付き点群を ASCII PLY で書き出す
///
/// 1行1点で `"X Y Z R G B"`。親ディレクトリがなければ作る。
pub fn write_point_cloud(path: impl AsRef<Path>, points: &[(Point3D, [u8; 3])]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut out = BufWriter::new(File::create(path)?);
    write!(
        out,
        "ply\n\
         format ascii 1.0\n\
         element vertex {}\n\
         property float x\n\
         property float y\n\
         property float z\n\
         property uchar red\n\
         property uchar green\n\
         property uchar blue\n\
         end_header\n",
        points.len()
    )?;

    for (p, [r, g, b]) in points {
        writeln!(out, "{} {} {} {} {} {}", p.x, p.y, p.z, r, g, b)?;
    }
    out.flush()?;

    info!("wrote {} points to {}", points.len(), path.display());
    Ok(())
}
