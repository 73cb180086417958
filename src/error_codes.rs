//! Static knowledge base of common toolchain diagnostic codes.
//!
//! Entries enrich classified errors with an explanation, suggested fixes and
//! a documentation link. Enrichment is best-effort: a code without an entry
//! is still classified, only without the extra detail.

use crate::error_taxonomy::ErrorCategory;

/// Curated information about one diagnostic code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCodeInfo {
    pub code: &'static str,
    pub title: &'static str,
    pub explanation: &'static str,
    pub suggested_fixes: &'static [&'static str],
    pub documentation_url: &'static str,
}

// === Prefix Families ===

/// Code prefix to category mapping, longest prefixes first.
const PREFIX_CATEGORIES: &[(&str, ErrorCategory)] = &[
    ("NETSDK", ErrorCategory::Sdk),
    ("MSB", ErrorCategory::Build),
    ("CS", ErrorCategory::Compilation),
    ("FS", ErrorCategory::Compilation),
    ("BC", ErrorCategory::Compilation),
    ("NU", ErrorCategory::Package),
];

/// Normalize a diagnostic code for lookups (`cs0103 ` -> `CS0103`).
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Category implied by a code's prefix; `Unknown` when unrecognized.
#[must_use]
pub fn category_for_code(code: &str) -> ErrorCategory {
    let normalized = normalize_code(code);
    PREFIX_CATEGORIES
        .iter()
        .find(|(prefix, _)| {
            normalized.starts_with(prefix)
                && normalized[prefix.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
        })
        .map_or(ErrorCategory::Unknown, |(_, category)| *category)
}

/// Look up a code in the knowledge base.
#[must_use]
pub fn lookup(code: &str) -> Option<&'static ErrorCodeInfo> {
    let normalized = normalize_code(code);
    KNOWN_CODES.iter().find(|info| info.code == normalized)
}

/// Documentation link for a code: the curated one, or the family's
/// reference page when the prefix is known.
#[must_use]
pub fn documentation_url(code: &str) -> Option<String> {
    if let Some(info) = lookup(code) {
        return Some(info.documentation_url.to_string());
    }
    let normalized = normalize_code(code);
    let lower = normalized.to_ascii_lowercase();
    match category_for_code(&normalized) {
        ErrorCategory::Compilation if normalized.starts_with("CS") => Some(format!(
            "https://learn.microsoft.com/dotnet/csharp/misc/{lower}"
        )),
        ErrorCategory::Build => Some(format!(
            "https://learn.microsoft.com/visualstudio/msbuild/errors/{lower}"
        )),
        ErrorCategory::Package => Some(format!(
            "https://learn.microsoft.com/nuget/reference/errors-and-warnings/{lower}"
        )),
        ErrorCategory::Sdk => Some(format!(
            "https://learn.microsoft.com/dotnet/core/tools/sdk-errors/{lower}"
        )),
        _ => None,
    }
}

// === Knowledge Base ===

static KNOWN_CODES: &[ErrorCodeInfo] = &[
    ErrorCodeInfo {
        code: "CS0029",
        title: "Cannot implicitly convert type",
        explanation: "An expression of one type is assigned to a variable or parameter of an incompatible type without an explicit conversion.",
        suggested_fixes: &[
            "Add an explicit cast if the conversion is valid",
            "Change the declared type of the target",
            "Use a conversion method such as int.Parse or ToString()",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs0029",
    },
    ErrorCodeInfo {
        code: "CS0103",
        title: "The name does not exist in the current context",
        explanation: "The compiler could not resolve an identifier. It is misspelled, out of scope, or declared in a namespace that is not imported.",
        suggested_fixes: &[
            "Check the spelling and casing of the identifier",
            "Add the missing using directive",
            "Make sure the variable is declared in an enclosing scope",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs0103",
    },
    ErrorCodeInfo {
        code: "CS0117",
        title: "Type does not contain a definition",
        explanation: "A member is accessed on a type that does not declare it.",
        suggested_fixes: &[
            "Check the member name for typos",
            "Verify the referenced package version exposes the member",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs0117",
    },
    ErrorCodeInfo {
        code: "CS0246",
        title: "The type or namespace name could not be found",
        explanation: "A type or namespace is referenced but neither declared in the project nor provided by any referenced assembly or package.",
        suggested_fixes: &[
            "Add the missing using directive",
            "Add a package or project reference that provides the type",
            "Run a restore if the package was recently added",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs0246",
    },
    ErrorCodeInfo {
        code: "CS1002",
        title: "; expected",
        explanation: "A statement is missing its terminating semicolon.",
        suggested_fixes: &["Add the missing semicolon at the end of the statement"],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs1002",
    },
    ErrorCodeInfo {
        code: "CS1061",
        title: "Type does not contain a definition and no accessible extension method",
        explanation: "A member or extension method is invoked on a type that does not provide it.",
        suggested_fixes: &[
            "Check the member name for typos",
            "Import the namespace that declares the extension method",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs1061",
    },
    ErrorCodeInfo {
        code: "CS1513",
        title: "} expected",
        explanation: "A block is missing its closing brace.",
        suggested_fixes: &["Balance the braces of the enclosing block"],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs1513",
    },
    ErrorCodeInfo {
        code: "CS5001",
        title: "Program does not contain a static Main method",
        explanation: "An executable project has no entry point.",
        suggested_fixes: &[
            "Add a static Main method or top-level statements",
            "Set OutputType to Library if the project is not meant to run",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/misc/cs5001",
    },
    ErrorCodeInfo {
        code: "CS8600",
        title: "Converting null literal or possible null value to non-nullable type",
        explanation: "Nullable reference analysis found a possibly-null value flowing into a non-nullable location.",
        suggested_fixes: &[
            "Declare the target as nullable",
            "Check for null before the assignment",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/csharp/language-reference/compiler-messages/nullable-warnings",
    },
    ErrorCodeInfo {
        code: "MSB1003",
        title: "Specify a project or solution file",
        explanation: "The working directory contains no project or solution file, so the build engine does not know what to build.",
        suggested_fixes: &[
            "Pass the path to a project or solution file",
            "Run the command from the project directory",
        ],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb1003",
    },
    ErrorCodeInfo {
        code: "MSB1009",
        title: "Project file does not exist",
        explanation: "The project or solution path passed to the build does not exist.",
        suggested_fixes: &["Check the path and file name of the project"],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb1009",
    },
    ErrorCodeInfo {
        code: "MSB1011",
        title: "More than one project or solution file",
        explanation: "The working directory contains several project or solution files and none was specified.",
        suggested_fixes: &["Pass the specific project or solution file to build"],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb1011",
    },
    ErrorCodeInfo {
        code: "MSB3021",
        title: "Unable to copy file",
        explanation: "A build output could not be copied, usually because another process holds the file open.",
        suggested_fixes: &[
            "Stop running instances of the application",
            "Wait for the concurrent build to finish",
        ],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb3021",
    },
    ErrorCodeInfo {
        code: "MSB3073",
        title: "Command exited with a non-zero code",
        explanation: "A build step ran an external command that failed.",
        suggested_fixes: &["Inspect the output of the custom build step"],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb3073",
    },
    ErrorCodeInfo {
        code: "MSB3644",
        title: "Reference assemblies for the framework were not found",
        explanation: "The targeting pack for the project's target framework is not installed.",
        suggested_fixes: &[
            "Install the developer pack or SDK for the target framework",
            "Retarget the project to an installed framework",
        ],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb3644",
    },
    ErrorCodeInfo {
        code: "MSB4019",
        title: "Imported project was not found",
        explanation: "A project imports a targets file that does not exist, often because a required SDK or workload is missing.",
        suggested_fixes: &[
            "Install the SDK or workload that provides the targets",
            "Check the Sdk attribute of the project file",
        ],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb4019",
    },
    ErrorCodeInfo {
        code: "MSB4236",
        title: "The specified SDK could not be found",
        explanation: "The project references an MSBuild SDK that could not be resolved.",
        suggested_fixes: &[
            "Install the SDK version required by global.json",
            "Check the Sdk attribute of the project file",
        ],
        documentation_url: "https://learn.microsoft.com/visualstudio/msbuild/errors/msb4236",
    },
    ErrorCodeInfo {
        code: "NU1100",
        title: "Unable to resolve dependency",
        explanation: "No configured feed provides a package matching the requested id and version range.",
        suggested_fixes: &[
            "Check the configured package sources",
            "Relax the version constraint",
        ],
        documentation_url: "https://learn.microsoft.com/nuget/reference/errors-and-warnings/nu1100",
    },
    ErrorCodeInfo {
        code: "NU1101",
        title: "Unable to find package",
        explanation: "The package id does not exist on any configured source.",
        suggested_fixes: &[
            "Check the package id for typos",
            "Add the feed that hosts the package to NuGet.config",
        ],
        documentation_url: "https://learn.microsoft.com/nuget/reference/errors-and-warnings/nu1101",
    },
    ErrorCodeInfo {
        code: "NU1102",
        title: "Unable to find package with version",
        explanation: "The package exists but no version satisfies the requested range.",
        suggested_fixes: &[
            "Request a version that is published on the feed",
            "Enable prerelease versions if the version is a prerelease",
        ],
        documentation_url: "https://learn.microsoft.com/nuget/reference/errors-and-warnings/nu1102",
    },
    ErrorCodeInfo {
        code: "NU1103",
        title: "Unable to find a stable package version",
        explanation: "Only prerelease versions match the requested range.",
        suggested_fixes: &["Request the prerelease version explicitly"],
        documentation_url: "https://learn.microsoft.com/nuget/reference/errors-and-warnings/nu1103",
    },
    ErrorCodeInfo {
        code: "NU1202",
        title: "Package is not compatible with the target framework",
        explanation: "The package does not ship assets for the project's target framework.",
        suggested_fixes: &[
            "Choose a package version that supports the target framework",
            "Retarget the project",
        ],
        documentation_url: "https://learn.microsoft.com/nuget/reference/errors-and-warnings/nu1202",
    },
    ErrorCodeInfo {
        code: "NU1301",
        title: "Unable to load the service index for source",
        explanation: "A package source could not be reached or rejected the credentials.",
        suggested_fixes: &[
            "Check network connectivity to the feed",
            "Refresh the feed credentials",
        ],
        documentation_url: "https://learn.microsoft.com/nuget/reference/errors-and-warnings/nu1301",
    },
    ErrorCodeInfo {
        code: "NU1605",
        title: "Detected package downgrade",
        explanation: "A direct reference pins a lower version than a transitive dependency requires.",
        suggested_fixes: &["Reference the higher version directly"],
        documentation_url: "https://learn.microsoft.com/nuget/reference/errors-and-warnings/nu1605",
    },
    ErrorCodeInfo {
        code: "NETSDK1004",
        title: "Assets file not found",
        explanation: "The project has not been restored, so project.assets.json is missing.",
        suggested_fixes: &["Run a restore before building"],
        documentation_url: "https://learn.microsoft.com/dotnet/core/tools/sdk-errors/netsdk1004",
    },
    ErrorCodeInfo {
        code: "NETSDK1005",
        title: "Assets file has no target for the framework",
        explanation: "The restore output does not include the target framework being built.",
        suggested_fixes: &["Run a restore after changing target frameworks"],
        documentation_url: "https://learn.microsoft.com/dotnet/core/tools/sdk-errors/netsdk1005",
    },
    ErrorCodeInfo {
        code: "NETSDK1045",
        title: "The current SDK does not support the target framework",
        explanation: "The installed SDK is older than the framework the project targets.",
        suggested_fixes: &[
            "Install a newer SDK",
            "Lower the project's target framework",
            "Check global.json for a pinned SDK version",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/core/tools/sdk-errors/netsdk1045",
    },
    ErrorCodeInfo {
        code: "NETSDK1047",
        title: "Assets file has no target for the runtime identifier",
        explanation: "The project was restored without the runtime identifier used for build or publish.",
        suggested_fixes: &["Restore with the same runtime identifier"],
        documentation_url: "https://learn.microsoft.com/dotnet/core/tools/sdk-errors/netsdk1047",
    },
    ErrorCodeInfo {
        code: "NETSDK1141",
        title: "Unable to resolve the SDK version from global.json",
        explanation: "global.json pins an SDK version that is not installed.",
        suggested_fixes: &[
            "Install the pinned SDK version",
            "Update or relax the version in global.json",
        ],
        documentation_url: "https://learn.microsoft.com/dotnet/core/tools/sdk-errors/netsdk1141",
    },
];
