//! Reading and writing `.ipynb` files through the `nbformat` crate.
//!
//! Anything `nbformat` can read is accepted: v4.5 as is, older v4 minors
//! after upgrading (which gives every cell an id). Files are always written
//! as v4.5.

use std::path::Path;

use nbformat::v4;
use serde_json::{Map, Value};

use crate::ids::CellId;
use crate::model::{split_lines, Cell, CodeCell, Metadata, Notebook, Output, TextCell};

/// Typed `nbformat` fields that serialize as `null` when absent.
const OPTIONAL_NOTEBOOK_METADATA: [&str; 3] = ["kernelspec", "language_info", "authors"];
const OPTIONAL_CELL_METADATA: [&str; 10] = [
    "id",
    "collapsed",
    "scrolled",
    "deletable",
    "editable",
    "format",
    "name",
    "tags",
    "jupyter",
    "execution",
];

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("not a readable notebook: {0}")]
    Parse(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn parse_notebook(text: &str) -> Result<Notebook, FormatError> {
    let parsed = nbformat::parse_notebook(text).map_err(|e| FormatError::Parse(e.to_string()))?;
    let notebook = match parsed {
        nbformat::Notebook::V4(notebook) => notebook,
        nbformat::Notebook::Legacy(legacy) => nbformat::upgrade_legacy_notebook(legacy)
            .map_err(|e| FormatError::Parse(e.to_string()))?,
    };
    from_v4(notebook)
}

pub fn serialize_notebook(notebook: &Notebook) -> Result<String, FormatError> {
    let notebook = nbformat::Notebook::V4(to_v4(notebook)?);
    nbformat::serialize_notebook(&notebook).map_err(|e| FormatError::Parse(e.to_string()))
}

pub fn read_notebook(path: &Path) -> Result<Notebook, FormatError> {
    let text = std::fs::read_to_string(path)?;
    parse_notebook(&text)
}

pub fn write_notebook(path: &Path, notebook: &Notebook) -> Result<(), FormatError> {
    let text = serialize_notebook(notebook)?;
    std::fs::write(path, text)?;
    Ok(())
}

fn from_v4(notebook: v4::Notebook) -> Result<Notebook, FormatError> {
    let metadata = metadata_map(serde_json::to_value(&notebook.metadata)?, &OPTIONAL_NOTEBOOK_METADATA);
    let mut model = Notebook::new().with_metadata(metadata);

    for cell in notebook.cells {
        let (id, cell) = from_v4_cell(cell)?;
        let end = model.len();
        if !model.insert_cell_at(end, id, cell.clone()) {
            // A repeated id: the cell still loads, under a fresh one.
            model.insert_cell_at(end, CellId::new(), cell);
        }
    }
    Ok(model)
}

fn from_v4_cell(cell: v4::Cell) -> Result<(CellId, Cell), FormatError> {
    let converted = match cell {
        v4::Cell::Code {
            id,
            metadata,
            execution_count,
            source,
            outputs,
        } => {
            let outputs = outputs
                .iter()
                .map(|output| Output::from_json(serde_json::to_value(output)?))
                .collect::<Result<Vec<_>, serde_json::Error>>()?;
            (
                CellId::from(id.as_str()),
                Cell::Code(CodeCell {
                    metadata: cell_metadata(&metadata)?,
                    source: source.concat(),
                    execution_count: execution_count.and_then(|count| u32::try_from(count).ok()),
                    outputs,
                }),
            )
        }
        v4::Cell::Markdown {
            id,
            metadata,
            source,
            attachments,
        } => {
            let attachments = Some(serde_json::to_value(&attachments)?).filter(|a| !a.is_null());
            (
                CellId::from(id.as_str()),
                Cell::Markdown(TextCell {
                    metadata: cell_metadata(&metadata)?,
                    source: source.concat(),
                    attachments,
                }),
            )
        }
        v4::Cell::Raw {
            id,
            metadata,
            source,
        } => (
            CellId::from(id.as_str()),
            Cell::Raw(TextCell {
                metadata: cell_metadata(&metadata)?,
                source: source.concat(),
                attachments: None,
            }),
        ),
    };
    Ok(converted)
}

fn cell_metadata(metadata: &v4::CellMetadata) -> Result<Metadata, FormatError> {
    Ok(metadata_map(serde_json::to_value(metadata)?, &OPTIONAL_CELL_METADATA))
}

/// A metadata object without the `null`s that stand for unset typed fields.
fn metadata_map(value: Value, optional: &[&str]) -> Metadata {
    let Value::Object(mut map) = value else {
        return Map::new();
    };
    map.retain(|key, value| !(value.is_null() && optional.contains(&key.as_str())));
    map
}

fn to_v4(notebook: &Notebook) -> Result<v4::Notebook, FormatError> {
    let cells = notebook
        .cells()
        .map(|(id, cell)| to_v4_cell(id, cell))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(v4::Notebook {
        metadata: serde_json::from_value(Value::Object(notebook.metadata().clone()))?,
        nbformat: 4,
        nbformat_minor: 5,
        cells,
    })
}

fn to_v4_cell(id: &CellId, cell: &Cell) -> Result<v4::Cell, FormatError> {
    let id: v4::CellId = serde_json::from_value(Value::String(id.to_string()))?;
    let metadata: v4::CellMetadata = serde_json::from_value(Value::Object(cell.metadata().clone()))?;
    let source = split_lines(cell.source());

    let converted = match cell {
        Cell::Code(code) => v4::Cell::Code {
            id,
            metadata,
            execution_count: code.execution_count.and_then(|count| i32::try_from(count).ok()),
            source,
            outputs: code
                .outputs
                .iter()
                .map(|output| serde_json::from_value(serde_json::to_value(output)?))
                .collect::<Result<Vec<_>, serde_json::Error>>()?,
        },
        Cell::Markdown(text) => v4::Cell::Markdown {
            id,
            metadata,
            source,
            attachments: serde_json::from_value(text.attachments.clone().unwrap_or(Value::Null))?,
        },
        Cell::Raw(_) => v4::Cell::Raw {
            id,
            metadata,
            source,
        },
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CellType, MimeBundle, StreamName};
    use serde_json::json;

    const NOTEBOOK: &str = r##"{
 "cells": [
  {
   "cell_type": "markdown",
   "id": "intro",
   "metadata": {},
   "source": [
    "# Title\n",
    "\n",
    "Some text"
   ]
  },
  {
   "cell_type": "code",
   "execution_count": 2,
   "id": "calc",
   "metadata": {
    "tags": [
     "parameters"
    ]
   },
   "outputs": [
    {
     "name": "stdout",
     "output_type": "stream",
     "text": [
      "hello\n",
      "world\n"
     ]
    },
    {
     "data": {
      "application/json": {
       "a": [
        1,
        2
       ]
      },
      "text/plain": [
       "{'a': [1, 2]}"
      ]
     },
     "execution_count": 2,
     "metadata": {},
     "output_type": "execute_result"
    },
    {
     "ename": "ValueError",
     "evalue": "bad",
     "output_type": "error",
     "traceback": [
      "Traceback"
     ]
    }
   ],
   "source": [
    "print('hello')\n",
    "{'a': [1, 2]}"
   ]
  },
  {
   "cell_type": "raw",
   "id": "raw1",
   "metadata": {},
   "source": []
  }
 ],
 "metadata": {
  "kernelspec": {
   "display_name": "Python 3",
   "language": "python",
   "name": "python3"
  },
  "language_info": {
   "name": "python",
   "version": "3.12.1"
  }
 },
 "nbformat": 4,
 "nbformat_minor": 5
}
"##;

    #[test]
    fn test_round_trip_keeps_the_model() {
        let notebook = parse_notebook(NOTEBOOK).unwrap();
        let written = serialize_notebook(&notebook).unwrap();
        assert_eq!(parse_notebook(&written).unwrap(), notebook);
    }

    #[test]
    fn test_parse_joins_multiline_strings() {
        let notebook = parse_notebook(NOTEBOOK).unwrap();
        let calc = notebook.cell(&CellId::from("calc")).unwrap();
        assert_eq!(calc.source(), "print('hello')\n{'a': [1, 2]}");
        assert_eq!(calc.execution_count(), Some(2));
        assert_eq!(
            calc.outputs()[0],
            Output::stream(StreamName::Stdout, "hello\nworld\n")
        );
        assert_eq!(calc.tags(), vec!["parameters"]);
        assert!(calc.metadata().get("collapsed").is_none());

        let Output::ExecuteResult { data, .. } = &calc.outputs()[1] else {
            panic!("expected an execute_result");
        };
        assert_eq!(data.get("text/plain"), Some(&json!("{'a': [1, 2]}")));
        assert_eq!(data.get("application/json"), Some(&json!({"a": [1, 2]})));

        let order: Vec<&str> = notebook.cell_order().iter().map(CellId::as_str).collect();
        assert_eq!(order, vec!["intro", "calc", "raw1"]);
        assert_eq!(notebook.kernelspec_name(), Some("python3"));
    }

    #[test]
    fn test_rejects_what_nbformat_rejects() {
        assert!(parse_notebook(r#"{"nbformat": 3, "nbformat_minor": 0, "worksheets": []}"#).is_err());
        assert!(parse_notebook(r#"{"cells": []}"#).is_err());
        assert!(parse_notebook("not json").is_err());
    }

    #[test]
    fn test_old_minor_gets_ids_and_is_written_as_4_5() {
        let notebook = parse_notebook(
            r#"{"nbformat": 4, "nbformat_minor": 4, "metadata": {},
                "cells": [{"cell_type": "code", "execution_count": null,
                           "metadata": {}, "outputs": [], "source": "1 + 1"}]}"#,
        )
        .unwrap();
        assert_eq!(notebook.len(), 1);
        assert!(notebook.is_consistent());
        let id = notebook.cell_order()[0].clone();
        assert_eq!(notebook.cell(&id).map(Cell::source), Some("1 + 1"));

        let written: Value = serde_json::from_str(&serialize_notebook(&notebook).unwrap()).unwrap();
        assert_eq!(written["nbformat_minor"], 5);
        assert_eq!(written["cells"][0]["id"], json!(id.as_str()));
    }

    #[test]
    fn test_duplicate_ids_are_replaced() {
        let notebook = parse_notebook(
            r#"{"nbformat": 4, "nbformat_minor": 5, "metadata": {},
                "cells": [
                  {"cell_type": "markdown", "id": "same", "metadata": {}, "source": "a"},
                  {"cell_type": "markdown", "id": "same", "metadata": {}, "source": "b"}
                ]}"#,
        )
        .unwrap();
        assert_eq!(notebook.len(), 2);
        assert!(notebook.is_consistent());
        assert_eq!(notebook.cell(&CellId::from("same")).map(Cell::source), Some("a"));
    }

    #[test]
    fn test_new_cells_survive_a_write() {
        let mut bundle = MimeBundle::new().with("text/plain", "line one\nline two");
        bundle = bundle.with("application/vnd.custom+json", json!({"keep": ["as", "is"]}));
        let mut code = Cell::with_source(CellType::Code, "x = 1\nx");
        if let Some(code) = code.as_code_mut() {
            code.execution_count = Some(1);
            code.outputs.push(Output::display_data(bundle, Some("transient-only")));
        }
        let notebook = Notebook::from_cells([
            (CellId::from("x"), code),
            (CellId::from("y"), Cell::with_source(CellType::Markdown, "")),
        ]);

        let text = serialize_notebook(&notebook).unwrap();
        assert!(!text.contains("transient-only"));

        let reread = parse_notebook(&text).unwrap();
        let x = reread.cell(&CellId::from("x")).unwrap();
        assert_eq!(x.source(), "x = 1\nx");
        assert_eq!(x.execution_count(), Some(1));
        let Output::DisplayData { data, .. } = &x.outputs()[0] else {
            panic!("expected display_data");
        };
        assert_eq!(data.get("text/plain"), Some(&json!("line one\nline two")));
        assert_eq!(
            data.get("application/vnd.custom+json"),
            Some(&json!({"keep": ["as", "is"]}))
        );
        assert_eq!(reread.cell_order(), notebook.cell_order());
    }
}
