use image::GrayImage;
use nalgebra::Point2;
use opencv::{
    calib3d,
    core::{Mat, Point2f, Size, Vector},
    prelude::*,
};

use super::{BoardSpec, ChessboardDetector};
use crate::error::{Result, StereoError};

/// OpenCV の findChessboardCorners による検出器
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvChessboardDetector;

fn cv_err(e: opencv::Error) -> StereoError {
    StereoError::Detector(e.to_string())
}

impl ChessboardDetector for OpenCvChessboardDetector {
    fn find_corners(&self, gray: &GrayImage, board: &BoardSpec) -> Result<Option<Vec<Point2<f64>>>> {
        let (w, h) = gray.dimensions();
        let mat = Mat::new_rows_cols_with_data(h as i32, w as i32, gray.as_raw().as_slice()).map_err(cv_err)?;

        let mut corners = Vector::<Point2f>::new();
        let found = calib3d::find_chessboard_corners(
            &*mat,
            Size::new(board.cols as i32, board.rows as i32),
            &mut corners,
            calib3d::CALIB_CB_ADAPTIVE_THRESH | calib3d::CALIB_CB_NORMALIZE_IMAGE,
        )
        .map_err(cv_err)?;

        if !found {
            return Ok(None);
        }
        Ok(Some(
            corners
                .iter()
                .map(|p| Point2::new(p.x as f64, p.y as f64))
                .collect(),
        ))
    }
}
