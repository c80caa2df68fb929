use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use url::Url;
use zip::ZipArchive;

use crate::error::*;

pub mod download;
pub mod install;
pub mod process;
pub mod progress;
pub mod releases;
pub mod runtime;
pub mod toolchain;

use download::*;
use install::*;
use process::*;
use progress::*;
use releases::*;
use runtime::*;
use toolchain::*;
