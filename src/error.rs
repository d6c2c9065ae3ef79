/*
 * This file is part of Smartamp.
 *
 * Copyright (C) 2025 Smartamp contributors
 *
 * Smartamp is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Smartamp is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Smartamp. If not, see <https://www.gnu.org/licenses/>.
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmpError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("out of memory: {0}")]
    NoMem(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("calibration data out of range")]
    CalibrationInvalid,
}

pub type Result<T> = std::result::Result<T, AmpError>;
