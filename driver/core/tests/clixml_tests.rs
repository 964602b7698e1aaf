// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Decoding of captured PowerShell error streams.

use hyperv_csi_core::infrastructure::clixml::CliXmlDecoder;

const NEW_VHD_ERROR: &str = r#"#< CLIXML
<Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04">
  <S S="Error">New-VHD : Failed to create the virtual hard disk._x000D__x000A_</S>
  <S S="Error">The system failed to create 'V:\Hyper-V\Virtual Hard Disks\pvc-b0475d14-782d-4485-b09c-ee93150dca72.vhdx'._x000D__x000A_</S>
  <S S="Error">Failed to create the virtual hard disk._x000D__x000A_</S>
  <S S="Error">The system failed to create 'V:\Hyper-V\Virtual Hard Disks\pvc-b0475d14-782d-4485-b09c-ee93150dca72.vhdx': The file _x000D__x000A_</S>
  <S S="Error">exists. (0x80070050)._x000D__x000A_</S>
  <S S="Error">At line:1 char:42_x000D__x000A_</S>
  <S S="Error">+ ... lyContinue';New-VHD -Path 'V:\Hyper-V\Virtual Hard Disks\pvc-b0475d14 ..._x000D__x000A_</S>
  <S S="Error">+                 ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~_x000D__x000A_</S>
  <S S="Error">    + CategoryInfo          : NotSpecified: (:) [New-VHD], VirtualizationException_x000D__x000A_</S>
  <S S="Error">    + FullyQualifiedErrorId : OperationFailed,Microsoft.Vhd.PowerShell.Cmdlets.NewVhd_x000D__x000A_</S>
  <S S="Error"> _x000D__x000A_</S>
</Objs> 
"#;

#[test]
fn test_new_vhd_error_envelope() {
    let expected = [
        "New-VHD : Failed to create the virtual hard disk.",
        r"The system failed to create 'V:\Hyper-V\Virtual Hard Disks\pvc-b0475d14-782d-4485-b09c-ee93150dca72.vhdx'.",
        "Failed to create the virtual hard disk.",
        r"The system failed to create 'V:\Hyper-V\Virtual Hard Disks\pvc-b0475d14-782d-4485-b09c-ee93150dca72.vhdx': The file ",
        "exists. (0x80070050).",
        "At line:1 char:42",
        r"+ ... lyContinue';New-VHD -Path 'V:\Hyper-V\Virtual Hard Disks\pvc-b0475d14 ...",
        "+                 ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~",
        "    + CategoryInfo          : NotSpecified: (:) [New-VHD], VirtualizationException",
        "    + FullyQualifiedErrorId : OperationFailed,Microsoft.Vhd.PowerShell.Cmdlets.NewVhd",
    ]
    .join("\n");

    assert_eq!(CliXmlDecoder::new().parse(NEW_VHD_ERROR), expected);
}

#[test]
fn test_crlf_wrapped_envelope() {
    let input = NEW_VHD_ERROR.replace('\n', "\r\n");
    let output = CliXmlDecoder::new().parse(&input);
    assert!(output.starts_with("New-VHD : Failed to create the virtual hard disk.\n"));
    assert!(!output.contains('\r'));
}

#[test]
fn test_escaped_underscore_and_entities() {
    let input = "#< CLIXML\r\n<Objs><S>pv_x005F_temp &lt;b0475d14&gt;</S></Objs>";
    assert_eq!(CliXmlDecoder::new().parse(input), "pv_temp <b0475d14>");
}

#[test]
fn test_plain_multiline_output_passes_through() {
    let input = "pv-eab72431-5d15-4152-a8d1-5cf4ea41627e.vhdx\npv-0b7c1c52-9f0a-4a55-a0d4-2f4a8a3f6b11.vhdx";
    assert_eq!(CliXmlDecoder::new().parse(input), input);
}
