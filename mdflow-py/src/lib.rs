//! Python bindings for the mdflow pipeline.
//!
//! Exposes the simulation tool to Python agents as plain functions that take
//! and return builtin types:
//!
//! ```python
//! import mdflow_py
//! result = mdflow_py.run_md_simulation("1abc.pdb", stages=["minimization", "nvt"])
//! print(result["message"])
//! ```

use mdflow::config::{ParameterOverrides, SimulationSettings};
use mdflow::errors::MdflowError;
use mdflow::observability::{init_tracing, LogFormat};
use mdflow::tool::{self, SimulationRequest};
use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use std::collections::BTreeMap;
use std::path::PathBuf;

create_exception!(mdflow_py, SimulationError, PyException, "Base class for mdflow errors.");
create_exception!(
    mdflow_py,
    ConfigurationError,
    SimulationError,
    "Invalid stage definitions or selection."
);
create_exception!(
    mdflow_py,
    MissingPrerequisiteError,
    SimulationError,
    "Engine, template or structure not found."
);
create_exception!(
    mdflow_py,
    ConcurrentRunError,
    SimulationError,
    "Work directory in use by another run."
);
create_exception!(
    mdflow_py,
    MissingDependencyError,
    SimulationError,
    "A completed stage's output vanished before the next stage ran."
);

fn to_py_err(err: &MdflowError) -> PyErr {
    let mut message = err.to_string();
    if let Some(hint) = err.error_info().and_then(|i| i.fix_hint.as_ref()) {
        message.push_str(&format!(" (hint: {hint})"));
    }
    match err {
        MdflowError::Configuration(_) => ConfigurationError::new_err(message),
        MdflowError::MissingPrerequisite(_) => MissingPrerequisiteError::new_err(message),
        MdflowError::ConcurrentRun(_) => ConcurrentRunError::new_err(message),
        MdflowError::MissingDependency(_) => MissingDependencyError::new_err(message),
        _ => SimulationError::new_err(message),
    }
}

fn load_settings() -> PyResult<SimulationSettings> {
    SimulationSettings::load().map_err(|e| to_py_err(&e))
}

fn parse_overrides(
    overrides: &Bound<'_, PyDict>,
) -> PyResult<BTreeMap<String, ParameterOverrides>> {
    let value = py_to_json(overrides.as_any())?;
    serde_json::from_value(value).map_err(|e| {
        ConfigurationError::new_err(format!(
            "overrides must map stage names to {{parameter: value}} dicts: {e}"
        ))
    })
}

/// Runs the MD pipeline on a PDB file and returns a result dict.
///
/// Raises `MissingPrerequisiteError` when GROMACS or the templates are not
/// provisioned, and `MissingDependencyError` when a completed stage's output
/// disappeared mid-run. Other stage failures are reported in the returned
/// dict under `status`, `failed_stage`, `failure` and `log_excerpt`.
#[pyfunction]
#[pyo3(signature = (pdb_file, work_dir=None, stages=None, force=false, overrides=None))]
fn run_md_simulation(
    py: Python<'_>,
    pdb_file: PathBuf,
    work_dir: Option<PathBuf>,
    stages: Option<Vec<String>>,
    force: bool,
    overrides: Option<&Bound<'_, PyDict>>,
) -> PyResult<PyObject> {
    let _ = init_tracing(LogFormat::from_env());
    let settings = load_settings()?;

    let mut request = SimulationRequest::new(pdb_file).with_force(force);
    if let Some(dir) = work_dir {
        request = request.with_work_dir(dir);
    }
    if let Some(stages) = stages {
        request = request
            .with_stages(stages.as_slice())
            .map_err(|e| to_py_err(&MdflowError::from(e)))?;
    }
    if let Some(overrides) = overrides {
        request.overrides = parse_overrides(overrides)?;
    }

    let report = py
        .allow_threads(|| tool::run_simulation_blocking(request, &settings))
        .map_err(|e| to_py_err(&e))?;
    let value = serde_json::to_value(&report).map_err(|e| SimulationError::new_err(e.to_string()))?;
    json_to_py(py, &value)
}

/// Reports whether GROMACS and the stage templates are available.
#[pyfunction]
fn check_requirements(py: Python<'_>) -> PyResult<PyObject> {
    let settings = load_settings()?;
    let report = tool::check_requirements(&settings);
    let mut value =
        serde_json::to_value(&report).map_err(|e| SimulationError::new_err(e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.insert("ready".to_string(), serde_json::json!(report.is_ready()));
    }
    json_to_py(py, &value)
}

// Helper functions

fn py_to_json(obj: &Bound<'_, PyAny>) -> PyResult<serde_json::Value> {
    if obj.is_none() {
        return Ok(serde_json::Value::Null);
    }

    if let Ok(b) = obj.extract::<bool>() {
        return Ok(serde_json::Value::Bool(b));
    }

    if let Ok(i) = obj.extract::<i64>() {
        return Ok(serde_json::Value::Number(i.into()));
    }

    if let Ok(f) = obj.extract::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Ok(serde_json::Value::Number(n));
        }
    }

    if let Ok(s) = obj.extract::<String>() {
        return Ok(serde_json::Value::String(s));
    }

    if let Ok(list) = obj.downcast::<PyList>() {
        let mut arr = Vec::new();
        for item in list.iter() {
            arr.push(py_to_json(&item)?);
        }
        return Ok(serde_json::Value::Array(arr));
    }

    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (key, value) in dict.iter() {
            let key_str: String = key.extract()?;
            map.insert(key_str, py_to_json(&value)?);
        }
        return Ok(serde_json::Value::Object(map));
    }

    Ok(serde_json::Value::String(obj.str()?.to_string()))
}

fn json_to_py(py: Python<'_>, value: &serde_json::Value) -> PyResult<PyObject> {
    Ok(match value {
        serde_json::Value::Null => py.None(),
        serde_json::Value::Bool(b) => b.to_object(py),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_py(py)
            } else if let Some(f) = n.as_f64() {
                f.into_py(py)
            } else {
                py.None()
            }
        }
        serde_json::Value::String(s) => s.to_object(py),
        serde_json::Value::Array(arr) => {
            let items = arr
                .iter()
                .map(|v| json_to_py(py, v))
                .collect::<PyResult<Vec<_>>>()?;
            PyList::new_bound(py, items).into_py(py)
        }
        serde_json::Value::Object(map) => {
            let dict = PyDict::new_bound(py);
            for (k, v) in map {
                dict.set_item(k, json_to_py(py, v)?)?;
            }
            dict.into_py(py)
        }
    })
}

/// The mdflow Python module.
#[pymodule]
fn mdflow_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_md_simulation, m)?)?;
    m.add_function(wrap_pyfunction!(check_requirements, m)?)?;

    let py = m.py();
    m.add("SimulationError", py.get_type_bound::<SimulationError>())?;
    m.add("ConfigurationError", py.get_type_bound::<ConfigurationError>())?;
    m.add("MissingPrerequisiteError", py.get_type_bound::<MissingPrerequisiteError>())?;
    m.add("ConcurrentRunError", py.get_type_bound::<ConcurrentRunError>())?;
    m.add(
        "MissingDependencyError",
        py.get_type_bound::<MissingDependencyError>(),
    )?;

    m.add("__version__", "0.1.0")?;
    m.add("__rust_version__", env!("CARGO_PKG_VERSION"))?;

    Ok(())
}
