// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::SchedulerOptions,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Scheduler options.
mod fibers_config {
    pub const SECTION_NAME: &str = "fibers";
    // Size of each fiber stack.
    pub const STACK_SIZE: &str = "stack_size";
    // Number of idle fibers kept for reuse.
    pub const MAX_FIBERS_POOL_SIZE: &str = "max_fibers_pool_size";
    // Measure stack usage with a fill pattern.
    pub const DEBUG_RECORD_STACK_USED: &str = "debug_record_stack_used";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fiber runtime configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        config_s.parse()
    }

    fn get_fibers_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, fibers_config::SECTION_NAME)
    }

    /// Reads the fiber stack size from the environment variable first and then the underlying configuration file.
    pub fn stack_size(&self) -> Result<usize, Fail> {
        let stack_size: usize = if let Some(size) = Self::get_typed_env_option(fibers_config::STACK_SIZE)? {
            size
        } else {
            match self.get_fibers_config()?.index(fibers_config::STACK_SIZE) {
                Yaml::BadValue => SchedulerOptions::default().stack_size,
                _ => Self::get_int_option(self.get_fibers_config()?, fibers_config::STACK_SIZE)?,
            }
        };

        if stack_size == 0 {
            let cause: String = "fiber stack size must be positive".to_string();
            error!("stack_size(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        Ok(stack_size)
    }

    /// Reads the fiber pool bound. Absent or null means unbounded.
    pub fn max_fibers_pool_size(&self) -> Result<Option<usize>, Fail> {
        if let Some(size) = Self::get_typed_env_option(fibers_config::MAX_FIBERS_POOL_SIZE)? {
            return Ok(Some(size));
        }
        match self.get_fibers_config()?.index(fibers_config::MAX_FIBERS_POOL_SIZE) {
            Yaml::BadValue | Yaml::Null => Ok(None),
            _ => Ok(Some(Self::get_int_option(
                self.get_fibers_config()?,
                fibers_config::MAX_FIBERS_POOL_SIZE,
            )?)),
        }
    }

    /// Reads whether fiber stack usage should be measured.
    pub fn debug_record_stack_used(&self) -> Result<bool, Fail> {
        if let Some(enabled) = Self::get_typed_env_option(fibers_config::DEBUG_RECORD_STACK_USED)? {
            return Ok(enabled);
        }
        match self.get_fibers_config()?.index(fibers_config::DEBUG_RECORD_STACK_USED) {
            Yaml::BadValue => Ok(false),
            _ => Self::get_bool_option(self.get_fibers_config()?, fibers_config::DEBUG_RECORD_STACK_USED),
        }
    }

    /// Builds scheduler options out of this configuration.
    pub fn scheduler_options(&self) -> Result<SchedulerOptions, Fail> {
        let mut options: SchedulerOptions = SchedulerOptions::default();
        options.stack_size = self.stack_size()?;
        options.max_fibers_pool_size = self.max_fibers_pool_size()?;
        options.debug_record_stack_used = self.debug_record_stack_used()?;
        Ok(options)
    }

    /// Index `yaml` to find the value at `index`, validating that it is a hash.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Same as `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }

    /// Same as `get_typed_option` using `Yaml::as_bool` as the receiver.
    fn get_bool_option(yaml: &Yaml, index: &str) -> Result<bool, Fail> {
        Self::get_typed_option(yaml, index, &Yaml::as_bool)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Parses configuration text into a [Config] object.
impl FromStr for Config {
    type Err = Fail;

    fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration ({})", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        match &config[..] {
            [c] => Ok(Self(c.clone())),
            _ => Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
